//! Local persistent store on redb.
//!
//! Two fixed tables: `wal`, the raw ordered history of ingested records,
//! and `checkpoint`, the replay cursor. Every workflow additionally gets its
//! own table, created on first write, holding the latest record per job name.
//!
//! Replay reads the WAL in key order, in bounded batches, starting strictly
//! after an in-memory cursor, and hands decoded jobs to a channel consumed by
//! the materialization path. The cursor starts at the durable checkpoint; the
//! checkpoint itself only moves when the consumer reports a batch as
//! materialized through [`Store::set_wal_offset`].

use parking_lot::{Mutex, RwLock};
use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableHandle,
};
use std::collections::HashMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Job, LogMessage, Replay, WalRecord, wal_key_seq};
use crate::telemetry::metrics;

const WAL_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("wal");
const CHECKPOINT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoint");
const WAL_OFFSET_KEY: &str = "wal_offset";
const DB_FILE: &str = "conductor.redb";
const REPLAY_CHANNEL_CAPACITY: usize = 128;

/// Table names workflows may not use.
pub const RESERVED_PARTITIONS: [&str; 2] = ["wal", "checkpoint"];

/// Records read per replay batch. Each batch ends with a
/// [`Replay::Checkpoint`] marker.
pub const WAL_BATCH_SIZE: usize = 100;

/// Whether `workflow` cannot name a partition.
pub fn is_reserved(workflow: &str) -> bool {
    workflow.is_empty() || RESERVED_PARTITIONS.contains(&workflow)
}

/// Handle to one workflow's table.
#[derive(Debug)]
pub struct Partition {
    workflow: String,
}

impl Partition {
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    fn definition(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.workflow)
    }
}

/// Storage backend. Owns the redb database for one cluster.
pub struct Store {
    name: String,
    path: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
    partitions: RwLock<HashMap<String, Arc<Partition>>>,
    partitions_created: AtomicUsize,
    wal_offset: Mutex<Option<Vec<u8>>>,
    replay_cursor: Mutex<Option<Vec<u8>>>,
    next_seq: Mutex<u64>,
    replay_tx: Mutex<Option<mpsc::Sender<Replay>>>,
    replay_rx: Mutex<Option<mpsc::Receiver<Replay>>>,
    replay_lock: tokio::sync::Mutex<()>,
    appended: Notify,
}

impl Store {
    /// Open or create the store for cluster `name` under `data_dir`.
    ///
    /// The database lives in `<data_dir>/<name>/`. Fixed tables are created
    /// if missing; existing workflow tables and the checkpoint are loaded.
    pub fn open(data_dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = data_dir.as_ref().join(name);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(DB_FILE);

        let db = Database::create(&path)?;

        let write = db.begin_write()?;
        write.open_table(WAL_TABLE)?;
        write.open_table(CHECKPOINT_TABLE)?;
        write.commit()?;

        let read = db.begin_read()?;
        let mut partitions = HashMap::new();
        for handle in read.list_tables()? {
            let table = handle.name();
            if !is_reserved(table) {
                partitions.insert(
                    table.to_string(),
                    Arc::new(Partition {
                        workflow: table.to_string(),
                    }),
                );
            }
        }
        let wal_offset = {
            let checkpoint = read.open_table(CHECKPOINT_TABLE)?;
            let offset = checkpoint.get(WAL_OFFSET_KEY)?.map(|v| v.value().to_vec());
            offset
        };
        let next_seq = {
            let wal = read.open_table(WAL_TABLE)?;
            let last = wal.last()?.map(|(key, _)| key.value().to_vec());
            match last {
                Some(key) => match wal_key_seq(&key) {
                    Some(seq) => seq.saturating_add(1),
                    None => wal.len()?,
                },
                None => 0,
            }
        };
        drop(read);

        info!(
            path = %path.display(),
            partitions = partitions.len(),
            resumed = wal_offset.is_some(),
            "store opened"
        );

        let (tx, rx) = mpsc::channel(REPLAY_CHANNEL_CAPACITY);

        Ok(Self {
            name: name.to_string(),
            path,
            db: RwLock::new(Some(Arc::new(db))),
            partitions: RwLock::new(partitions),
            partitions_created: AtomicUsize::new(0),
            replay_cursor: Mutex::new(wal_offset.clone()),
            wal_offset: Mutex::new(wal_offset),
            next_seq: Mutex::new(next_seq),
            replay_tx: Mutex::new(Some(tx)),
            replay_rx: Mutex::new(Some(rx)),
            replay_lock: tokio::sync::Mutex::new(()),
            appended: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.db.read().is_some()
    }

    /// Release the database, partition handles and replay channel.
    ///
    /// Idempotent. Later calls on the store fail with [`Error::Closed`].
    pub fn close(&self) {
        let db = self.db.write().take();
        self.partitions.write().clear();
        self.replay_tx.lock().take();
        self.replay_rx.lock().take();

        if db.is_some() {
            info!(name = %self.name, "store closed");
        }
    }

    fn db(&self) -> Result<Arc<Database>> {
        self.db.read().clone().ok_or(Error::Closed)
    }

    // -----------------------------------------------------------------------
    // WAL
    // -----------------------------------------------------------------------

    /// Append a log message under the next arrival sequence number.
    ///
    /// Sequence allocation and the insert happen under one lock, so keys
    /// commit in the order they sort. Returns the WAL key used.
    pub fn append_message(&self, msg: &LogMessage) -> Result<Vec<u8>> {
        let mut next_seq = self.next_seq.lock();
        let key = msg.wal_key(*next_seq);
        self.append_wal(&key, &msg.value)?;
        *next_seq += 1;
        Ok(key)
    }

    /// Append one record to the WAL in its own transaction. Replay order is
    /// the byte order of `key`.
    pub fn append_wal(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let db = self.db()?;
        let write = db.begin_write()?;
        write.open_table(WAL_TABLE)?.insert(key, value)?;
        write.commit()?;

        metrics::wal_appended().add(1, &[]);
        self.appended.notify_one();
        Ok(())
    }

    /// Append several records in a single transaction.
    pub fn append_wal_batch(&self, records: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let db = self.db()?;
        let write = db.begin_write()?;
        {
            let mut table = write.open_table(WAL_TABLE)?;
            for (key, value) in records {
                table.insert(key.as_slice(), value.as_slice())?;
            }
        }
        write.commit()?;

        metrics::wal_appended().add(records.len() as u64, &[]);
        self.appended.notify_one();
        Ok(())
    }

    /// Resolves after the next WAL append (immediately if one happened
    /// since the last wait).
    pub async fn wal_appended(&self) {
        self.appended.notified().await;
    }

    /// Up to `limit` raw WAL entries in key order, strictly after `after`.
    pub fn wal_entries(&self, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let db = self.db()?;
        let read = db.begin_read()?;
        let table = read.open_table(WAL_TABLE)?;

        let range = match after {
            Some(key) => table.range::<&[u8]>((Bound::Excluded(key), Bound::Unbounded))?,
            None => table.range::<&[u8]>(..)?,
        };

        let mut entries = Vec::with_capacity(limit.min(WAL_BATCH_SIZE));
        for entry in range.take(limit) {
            let (key, value) = entry?;
            entries.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(entries)
    }

    /// Number of records in the WAL.
    pub fn wal_len(&self) -> Result<u64> {
        let db = self.db()?;
        let read = db.begin_read()?;
        let len = read.open_table(WAL_TABLE)?.len()?;
        Ok(len)
    }

    /// Take the receiving end of the replay channel. Only one consumer
    /// exists; later calls return `None`.
    pub fn take_replay_receiver(&self) -> Option<mpsc::Receiver<Replay>> {
        self.replay_rx.lock().take()
    }

    /// Replay the WAL onto the replay channel, starting after the replay
    /// cursor.
    ///
    /// Reads batches of [`WAL_BATCH_SIZE`] records in key order. Records that
    /// fail to decode are logged and skipped. Every batch is followed by a
    /// [`Replay::Checkpoint`] carrying its last key, and the cursor moves past
    /// it so later calls send only new records. The durable checkpoint is
    /// left alone: after a restart replay resumes from the last batch the
    /// consumer confirmed. Concurrent calls run one after the other.
    ///
    /// Returns how many jobs were sent.
    pub async fn read_wal(&self) -> Result<usize> {
        let _replaying = self.replay_lock.lock().await;
        let tx = self.replay_tx.lock().clone().ok_or(Error::Closed)?;

        let mut cursor = self.replay_cursor();
        let mut replayed = 0;

        loop {
            let batch = self.wal_entries(cursor.as_deref(), WAL_BATCH_SIZE)?;
            let Some(last) = batch.last().map(|(key, _)| key.clone()) else {
                break;
            };
            let full = batch.len() == WAL_BATCH_SIZE;

            for (key, value) in batch {
                match Job::decode(&value) {
                    Ok(job) => {
                        tx.send(Replay::Record(WalRecord { key, job }))
                            .await
                            .map_err(|_| Error::Closed)?;
                        replayed += 1;
                    }
                    Err(e) => {
                        warn!(
                            key = %String::from_utf8_lossy(&key),
                            error = %e,
                            "skipping undecodable WAL record"
                        );
                        metrics::wal_decode_errors().add(1, &[]);
                    }
                }
            }

            tx.send(Replay::Checkpoint(last.clone()))
                .await
                .map_err(|_| Error::Closed)?;
            *self.replay_cursor.lock() = Some(last.clone());
            cursor = Some(last);

            if !full {
                break;
            }
        }

        if replayed > 0 {
            debug!(replayed, "WAL replayed");
            metrics::wal_replayed().add(replayed as u64, &[]);
        }
        Ok(replayed)
    }

    /// Last WAL key covered by the durable checkpoint.
    pub fn wal_offset(&self) -> Option<Vec<u8>> {
        self.wal_offset.lock().clone()
    }

    /// Last WAL key handed to the replay channel by this instance.
    pub fn replay_cursor(&self) -> Option<Vec<u8>> {
        self.replay_cursor.lock().clone()
    }

    /// Persist `key` as the checkpoint. Everything up to it must already be
    /// materialized.
    pub fn set_wal_offset(&self, key: &[u8]) -> Result<()> {
        let db = self.db()?;
        let write = db.begin_write()?;
        write.open_table(CHECKPOINT_TABLE)?.insert(WAL_OFFSET_KEY, key)?;
        write.commit()?;

        *self.wal_offset.lock() = Some(key.to_vec());
        Ok(())
    }

    /// Forget the checkpoint so the next replay starts from the beginning.
    pub fn rewind_wal(&self) -> Result<()> {
        let db = self.db()?;
        let write = db.begin_write()?;
        write.open_table(CHECKPOINT_TABLE)?.remove(WAL_OFFSET_KEY)?;
        write.commit()?;

        *self.wal_offset.lock() = None;
        *self.replay_cursor.lock() = None;
        info!("WAL checkpoint rewound");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Workflow partitions
    // -----------------------------------------------------------------------

    /// Decode a raw record and write it into its workflow's partition.
    pub fn add_job(&self, raw: &[u8]) -> Result<Job> {
        let job = Job::decode(raw)?;
        self.put_job(&job)?;
        Ok(job)
    }

    /// Write a job into its workflow's partition, keyed by name. Creates the
    /// partition on first use.
    pub fn put_job(&self, job: &Job) -> Result<()> {
        let partition = self.partition_or_create(&job.workflow)?;
        let value = job.encode()?;

        let db = self.db()?;
        let write = db.begin_write()?;
        write
            .open_table(partition.definition())?
            .insert(job.name.as_str(), value.as_slice())?;
        write.commit()?;
        Ok(())
    }

    /// Latest record for `workflow`/`name`.
    pub fn get_job(&self, workflow: &str, name: &str) -> Result<Option<Job>> {
        let Some(partition) = self.partition(workflow) else {
            return Ok(None);
        };

        let db = self.db()?;
        let read = db.begin_read()?;
        let table = read.open_table(partition.definition())?;
        let job = match table.get(name)? {
            Some(raw) => Some(Job::decode(raw.value())?),
            None => None,
        };
        Ok(job)
    }

    /// Delete a job from its partition. Returns whether it existed.
    pub fn delete_job(&self, workflow: &str, name: &str) -> Result<bool> {
        let Some(partition) = self.partition(workflow) else {
            return Ok(false);
        };

        let db = self.db()?;
        let write = db.begin_write()?;
        let existed = write
            .open_table(partition.definition())?
            .remove(name)?
            .is_some();
        write.commit()?;
        Ok(existed)
    }

    /// Every decodable job in `workflow`'s partition, ordered by name.
    pub fn jobs(&self, workflow: &str) -> Result<Vec<Job>> {
        let Some(partition) = self.partition(workflow) else {
            return Ok(Vec::new());
        };

        let db = self.db()?;
        let read = db.begin_read()?;
        let table = read.open_table(partition.definition())?;

        let mut jobs = Vec::new();
        for entry in table.iter()? {
            let (name, raw) = entry?;
            match Job::decode(raw.value()) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(workflow, name = name.value(), error = %e, "skipping undecodable job"),
            }
        }
        Ok(jobs)
    }

    /// The partition for `workflow`, if it exists.
    pub fn partition(&self, workflow: &str) -> Option<Arc<Partition>> {
        self.partitions.read().get(workflow).cloned()
    }

    /// Names of all workflow partitions, sorted.
    pub fn partitions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.partitions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Partitions created by this instance since it was opened.
    pub fn partitions_created(&self) -> usize {
        self.partitions_created.load(Ordering::Relaxed)
    }

    fn partition_or_create(&self, workflow: &str) -> Result<Arc<Partition>> {
        if let Some(partition) = self.partition(workflow) {
            return Ok(partition);
        }
        if is_reserved(workflow) {
            return Err(Error::ReservedPartition(workflow.to_string()));
        }

        let mut partitions = self.partitions.write();
        if let Some(partition) = partitions.get(workflow) {
            return Ok(Arc::clone(partition));
        }

        let partition = Arc::new(Partition {
            workflow: workflow.to_string(),
        });

        let db = self.db()?;
        let write = db.begin_write()?;
        write.open_table(partition.definition())?;
        write.commit()?;

        partitions.insert(workflow.to_string(), Arc::clone(&partition));
        self.partitions_created.fetch_add(1, Ordering::Relaxed);
        metrics::partitions_created().add(1, &[]);
        info!(workflow, "created workflow partition");

        Ok(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_cannot_be_partitions() {
        assert!(is_reserved("wal"));
        assert!(is_reserved("checkpoint"));
        assert!(is_reserved(""));
        assert!(!is_reserved("billing"));
    }

    #[test]
    fn put_job_rejects_reserved_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "cluster").unwrap();

        let err = store.put_job(&Job::new("wal", "a")).unwrap_err();
        assert!(matches!(err, Error::ReservedPartition(name) if name == "wal"));
        assert!(store.partitions().is_empty());
    }

    #[test]
    fn closed_store_refuses_work() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "cluster").unwrap();
        store.close();
        store.close();

        assert!(!store.is_open());
        assert!(matches!(store.append_wal(b"k", b"v"), Err(Error::Closed)));
        assert!(store.take_replay_receiver().is_none());
    }
}
