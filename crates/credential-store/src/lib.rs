//! Durable credential storage for the chat gateway
//!
//! A single SQLite table holds every session credential together with its
//! status and usage bookkeeping. This crate is the only place credential
//! state is mutated; the pool crate drives it through conditional updates so
//! that each row has at most one holder at a time.
//!
//! Credential flow:
//! 1. Operator adds raw secret material (admin API or the plain-text backup)
//! 2. `CredentialStore::load()` recovers rows left `in_flight` by a crash
//! 3. The pool claims a row with `try_acquire()` and returns it with `transition()`
//! 4. `record_outcome()` keeps failure counters and disables worn-out secrets
//! 5. `upsert_secret()` swaps in a secret the upstream rotated mid-request

pub mod backup;
pub mod error;
pub mod model;
pub mod store;

pub use error::{Error, Result};
pub use model::{Credential, CredentialStatus, now_millis};
pub use store::{CredentialStore, StoreOptions};
