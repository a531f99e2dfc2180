//! Secret handling utilities.
//!
//! Re-exports secrecy types used for log client credentials.

pub use secrecy::{ExposeSecret, SecretString};
