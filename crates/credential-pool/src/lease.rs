//! Request-scoped credential lease
//!
//! A `Lease` is the only way to hold a credential. It is released exactly
//! once: explicitly through `release()`, or from `Drop` with an outcome
//! inferred from what the holder reported while using it. Dropping a lease
//! is how caller cancellation reaches the pool, so a client that goes away
//! mid-stream never leaves its credential stuck in flight.

use std::sync::Arc;

use common::Secret;
use credential_store::{Credential, CredentialStatus};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::Pool;

/// How a request ended, from the credential's point of view.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Upstream answered; failure streak resets.
    Success,
    /// Upstream failed (transport error, bad status, timeout, bad framing).
    Failure,
    /// Success, and the upstream handed out a replacement secret.
    Refresh(Secret<String>),
    /// The caller went away before anything was delivered and the upstream
    /// had not failed. Not attributed to the credential either way.
    Cancelled,
}

impl Outcome {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Refresh(_) => "refresh",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// Exclusive hold on one credential for the duration of one request.
pub struct Lease {
    pool: Arc<Pool>,
    /// Snapshot taken at acquisition; `use_count` identifies the claim.
    credential: Credential,
    /// Rotated secret whose mid-stream write hit a store error; retried on release.
    pending_refresh: Option<Secret<String>>,
    delivered: u64,
    upstream_failed: bool,
    released: bool,
}

impl Lease {
    pub(crate) fn new(pool: Arc<Pool>, credential: Credential) -> Self {
        Self {
            pool,
            credential,
            pending_refresh: None,
            delivered: 0,
            upstream_failed: false,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.credential.id
    }

    /// Secret to present upstream. Reflects any refresh applied through
    /// this lease.
    pub fn secret(&self) -> &str {
        self.credential.secret.expose()
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Number of chunks reported as delivered to the caller.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Record that one chunk reached the caller.
    pub fn mark_delivered(&mut self) {
        self.delivered += 1;
    }

    /// Record that the upstream itself failed.
    pub fn mark_upstream_failed(&mut self) {
        self.upstream_failed = true;
    }

    /// Apply a secret the upstream rotated mid-request.
    ///
    /// The new secret is written to the store immediately, before the lease
    /// is released, so the next acquisition of this credential already sees
    /// it. The lease only presents the new secret once the write succeeded.
    /// A secret that already belongs to another credential is dropped and the
    /// lease keeps its current one. Repeating the same secret is a no-op.
    /// Returns whether the secret changed.
    pub fn refresh(&mut self, new_secret: &str) -> bool {
        let new_secret = new_secret.trim();
        if new_secret.is_empty() || self.credential.secret.matches(new_secret.as_bytes()) {
            return false;
        }

        match self.pool.apply_refresh(&self.credential.id, new_secret) {
            Ok(()) => {
                self.credential.secret = Secret::new(new_secret.to_string());
                self.pending_refresh = None;
                info!(
                    credential_id = self.credential.id,
                    secret_fp = self.credential.secret.fingerprint(),
                    "applied rotated secret"
                );
                true
            }
            Err(Error::Store(
                e @ (credential_store::Error::Database(_) | credential_store::Error::Io(_)),
            )) => {
                warn!(
                    credential_id = self.credential.id,
                    error = %e,
                    "failed to persist rotated secret, retrying on release"
                );
                self.pending_refresh = Some(Secret::new(new_secret.to_string()));
                false
            }
            Err(e) => {
                warn!(
                    credential_id = self.credential.id,
                    error = %e,
                    "rotated secret rejected, keeping current secret"
                );
                false
            }
        }
    }

    /// Release the credential with an explicit outcome.
    pub fn release(mut self, outcome: Outcome) -> Result<CredentialStatus> {
        self.settle(outcome)
    }

    /// Outcome implied by what the holder reported.
    ///
    /// An upstream failure always counts against the credential. Otherwise a
    /// lease that delivered anything succeeded, and one that delivered
    /// nothing was cancelled by the caller.
    fn implied_outcome(&self) -> Outcome {
        if self.upstream_failed {
            Outcome::Failure
        } else if self.delivered > 0 {
            Outcome::Success
        } else {
            Outcome::Cancelled
        }
    }

    fn settle(&mut self, outcome: Outcome) -> Result<CredentialStatus> {
        self.released = true;
        let outcome = match (self.pending_refresh.take(), outcome) {
            (Some(secret), Outcome::Success) => Outcome::Refresh(secret),
            (Some(secret), other) => {
                if let Err(e) = self.pool.apply_refresh(&self.credential.id, secret.expose()) {
                    warn!(credential_id = self.credential.id, error = %e, "rotated secret lost");
                }
                other
            }
            (None, other) => other,
        };
        debug!(
            credential_id = self.credential.id,
            outcome = outcome.label(),
            delivered = self.delivered,
            "releasing credential"
        );
        self.pool
            .release(&self.credential.id, self.credential.use_count, outcome)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let outcome = self.implied_outcome();
        if let Err(e) = self.settle(outcome) {
            warn!(credential_id = self.credential.id, error = %e, "failed to release dropped lease");
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("credential_id", &self.credential.id)
            .field("delivered", &self.delivered)
            .field("upstream_failed", &self.upstream_failed)
            .finish()
    }
}
