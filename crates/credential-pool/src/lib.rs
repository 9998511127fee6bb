//! Credential pool for the chat gateway
//!
//! Hands out one credential per request with at most one concurrent holder
//! per credential and fair rotation across the pool. Selection reads the
//! candidate list from `CredentialStore` and claims a row with a single
//! conditional update, so no pool-wide lock is ever taken.
//!
//! Credential lifecycle:
//! 1. `Pool::acquire()` claims the least-used eligible row → `Lease`
//! 2. The upstream rotates the secret mid-stream → `Lease::refresh()` persists it
//! 3. Request ends → `Lease::release(outcome)` (or the lease is dropped and
//!    infers the outcome from what it observed)
//! 4. Failures cool the credential down with exponential backoff; past the
//!    threshold it is disabled until an operator re-enables it

pub mod cooldown;
pub mod error;
pub mod lease;
pub mod pool;
pub mod recovery;

pub use cooldown::CooldownPolicy;
pub use error::{Error, Result};
pub use lease::{Lease, Outcome};
pub use pool::{Pool, PoolCounts, credential_summary};
pub use recovery::spawn_recovery_task;
