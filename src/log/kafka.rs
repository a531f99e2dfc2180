//! Kafka-backed log client via rdkafka.
//!
//! Only built with the `kafka` feature. The consumer joins the group named
//! after the cluster and starts from the earliest offset when the group has
//! no committed position.

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::info;

use super::{LogConsumer, LogEvent, LogProducer};
use crate::config::Config;
use crate::config::secrets::ExposeSecret;
use crate::error::{Error, Result};
use crate::model::{Job, LogMessage};

const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

fn client_config(config: &Config) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.brokers);

    if let (Some(username), Some(password)) = (&config.sasl_username, &config.sasl_password) {
        client
            .set("security.protocol", "SASL_SSL")
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password.expose_secret());
    }
    client
}

/// Consumer for the cluster topic.
pub struct KafkaConsumer {
    consumer: Option<StreamConsumer>,
}

impl KafkaConsumer {
    pub fn from_config(config: &Config) -> Result<Self> {
        info!(name = %config.name, brokers = %config.brokers, "creating Kafka consumer");

        let consumer: StreamConsumer = client_config(config)
            .set("group.id", &config.name)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| Error::Log(format!("failed to create consumer: {e}")))?;

        Ok(Self {
            consumer: Some(consumer),
        })
    }
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let consumer = self.consumer.as_ref().ok_or(Error::Closed)?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| Error::Log(format!("failed to subscribe to {topic}: {e}")))
    }

    async fn recv(&mut self) -> Option<LogEvent> {
        let consumer = self.consumer.as_ref()?;
        let event = match consumer.recv().await {
            Ok(msg) => LogEvent::Message(LogMessage {
                key: msg.key().map(<[u8]>::to_vec).unwrap_or_default(),
                value: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                partition: msg.partition(),
                offset: msg.offset(),
                timestamp: msg
                    .timestamp()
                    .to_millis()
                    .and_then(DateTime::from_timestamp_millis),
            }),
            Err(e) => LogEvent::Error(e.to_string()),
        };
        Some(event)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            info!("Kafka consumer closed");
        }
        Ok(())
    }
}

/// Publishes jobs to the cluster topic, keyed by workflow.
pub struct KafkaProducer {
    topic: String,
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn from_config(config: &Config) -> Result<Self> {
        let producer: FutureProducer = client_config(config)
            .create()
            .map_err(|e| Error::Log(format!("failed to create producer: {e}")))?;

        Ok(Self {
            topic: config.name.clone(),
            producer,
        })
    }
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn produce(&self, job: &Job) -> Result<()> {
        let payload = job.encode()?;
        let record = FutureRecord::to(&self.topic)
            .key(job.workflow.as_str())
            .payload(&payload);

        self.producer
            .send(record, PRODUCE_TIMEOUT)
            .await
            .map_err(|(e, _)| Error::Log(format!("delivery failed: {e}")))?;
        Ok(())
    }
}
