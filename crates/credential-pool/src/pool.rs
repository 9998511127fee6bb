//! Credential selection and release
//!
//! `acquire` walks the eligible rows in selection order (fewest uses first,
//! then longest idle) and tries to claim each one with the store's
//! conditional update. Losing a claim to a concurrent caller just moves on to
//! the next candidate; acquisition never blocks and never retries the same
//! row.
//!
//! `release` applies an `Outcome` to the claim a lease holds:
//! - Success → failure streak reset, `in_flight → active`
//! - Refresh → new secret written first, then as Success
//! - Failure → streak incremented, `in_flight → cooldown` (or disabled past
//!   the threshold)
//! - Cancelled → `in_flight → active`, no bookkeeping
//!
//! A lease whose row was reset by the stale sweep and claimed again is
//! superseded: its outcome is logged and dropped so it cannot free the row
//! under the current holder.

use std::sync::Arc;

use credential_store::{Credential, CredentialStatus, CredentialStore, now_millis};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::cooldown::CooldownPolicy;
use crate::error::{Error, Result};
use crate::lease::{Lease, Outcome};

/// Credential counts by effective status.
///
/// A cooling credential whose deadline has passed counts as active.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub total: usize,
    pub active: usize,
    pub in_flight: usize,
    pub cooling_down: usize,
    pub disabled: usize,
}

impl PoolCounts {
    pub fn from_credentials(credentials: &[Credential], now: u64) -> Self {
        let mut counts = PoolCounts {
            total: credentials.len(),
            ..PoolCounts::default()
        };
        for credential in credentials {
            match credential.status {
                CredentialStatus::Active => counts.active += 1,
                CredentialStatus::InFlight => counts.in_flight += 1,
                CredentialStatus::Cooldown if credential.is_eligible(now) => counts.active += 1,
                CredentialStatus::Cooldown => counts.cooling_down += 1,
                CredentialStatus::Disabled => counts.disabled += 1,
            }
        }
        counts
    }

    /// Credentials that are serving or can serve traffic.
    pub fn usable(&self) -> usize {
        self.active + self.in_flight
    }

    fn to_json(self) -> serde_json::Value {
        serde_json::json!({
            "credentials_total": self.total,
            "credentials_active": self.active,
            "credentials_in_flight": self.in_flight,
            "credentials_cooling_down": self.cooling_down,
            "credentials_disabled": self.disabled,
        })
    }
}

/// Pool of upstream credentials backed by the credential store.
pub struct Pool {
    store: Arc<CredentialStore>,
    cooldown: CooldownPolicy,
}

impl Pool {
    pub fn new(store: Arc<CredentialStore>, cooldown: CooldownPolicy) -> Self {
        Self { store, cooldown }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Claim one credential for one request.
    ///
    /// Returns `PoolExhausted` immediately when nothing is eligible or every
    /// candidate was claimed by someone else first.
    pub fn acquire(self: &Arc<Self>) -> Result<Lease> {
        let now = now_millis();
        for candidate in self.store.candidates(now)? {
            match self.store.try_acquire(&candidate.id, now)? {
                Some(claimed) => {
                    counter!("credential_pool_acquisitions_total", "result" => "acquired")
                        .increment(1);
                    debug!(
                        credential_id = claimed.id,
                        use_count = claimed.use_count,
                        "credential acquired"
                    );
                    return Ok(Lease::new(Arc::clone(self), claimed));
                }
                None => debug!(credential_id = candidate.id, "lost claim race, trying next"),
            }
        }

        counter!("credential_pool_acquisitions_total", "result" => "exhausted").increment(1);
        let counts = self.counts()?;
        warn!(
            total = counts.total,
            in_flight = counts.in_flight,
            cooling_down = counts.cooling_down,
            disabled = counts.disabled,
            "credential pool exhausted"
        );
        Err(Error::PoolExhausted(exhausted_message(counts)))
    }

    /// Settle the claim a lease holds. Returns the credential's status
    /// afterwards.
    pub(crate) fn release(&self, id: &str, claim: u64, outcome: Outcome) -> Result<CredentialStatus> {
        counter!("credential_pool_releases_total", "outcome" => outcome.label()).increment(1);
        match outcome {
            Outcome::Success => self.release_success(id, claim),
            Outcome::Refresh(secret) => {
                // Secret first: the row must not become claimable with the old one
                if let Err(e) = self.apply_refresh(id, secret.expose()) {
                    warn!(credential_id = id, error = %e, "rotated secret not persisted");
                }
                self.release_success(id, claim)
            }
            Outcome::Failure => self.release_failure(id, claim),
            Outcome::Cancelled => {
                if !self.store.transition(id, claim, CredentialStatus::Active, None)? {
                    return self.superseded(id, claim);
                }
                self.current_status(id)
            }
        }
    }

    /// Persist a rotated secret. Idempotent; does not touch status.
    pub fn apply_refresh(&self, id: &str, secret: &str) -> Result<()> {
        self.store.upsert_secret(id, secret)?;
        counter!("credential_rotations_total").increment(1);
        Ok(())
    }

    fn release_success(&self, id: &str, claim: u64) -> Result<CredentialStatus> {
        if self.store.record_outcome(id, claim, true)?.is_none() {
            return self.superseded(id, claim);
        }
        self.store.transition(id, claim, CredentialStatus::Active, None)?;
        self.current_status(id)
    }

    fn release_failure(&self, id: &str, claim: u64) -> Result<CredentialStatus> {
        let Some(credential) = self.store.record_outcome(id, claim, false)? else {
            return self.superseded(id, claim);
        };
        if credential.status == CredentialStatus::Disabled {
            return Ok(CredentialStatus::Disabled);
        }

        let cooldown = self.cooldown.duration_for(credential.consecutive_failures);
        let until = now_millis().saturating_add(cooldown.as_millis() as u64);
        let cooled = self
            .store
            .transition(id, claim, CredentialStatus::Cooldown, Some(until))?;
        if cooled {
            info!(
                credential_id = id,
                consecutive_failures = credential.consecutive_failures,
                cooldown_secs = cooldown.as_secs(),
                "credential entering cooldown"
            );
        }
        self.current_status(id)
    }

    /// The claim was recovered or taken over; the current holder owns the row.
    fn superseded(&self, id: &str, claim: u64) -> Result<CredentialStatus> {
        counter!("credential_pool_superseded_releases_total").increment(1);
        warn!(credential_id = id, claim, "lease superseded by a newer claim, outcome dropped");
        self.current_status(id)
    }

    fn current_status(&self, id: &str) -> Result<CredentialStatus> {
        self.store
            .get(id)?
            .map(|c| c.status)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Add raw secret material. `None` if the secret is already pooled.
    pub fn add_credential(&self, secret: &str) -> Result<Option<Credential>> {
        Ok(self.store.insert(secret)?)
    }

    pub fn import_backup(&self) -> Result<usize> {
        Ok(self.store.import_backup()?)
    }

    pub fn disable(&self, id: &str) -> Result<()> {
        Ok(self.store.disable(id)?)
    }

    /// Manual re-enable. `false` if the credential was not disabled or cooling.
    pub fn enable(&self, id: &str) -> Result<bool> {
        Ok(self.store.enable(id)?)
    }

    pub fn remove(&self, id: &str) -> Result<Credential> {
        self.store
            .remove(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn recover_stale(&self, now: u64) -> Result<usize> {
        Ok(self.store.recover_stale(now)?)
    }

    pub fn credentials(&self) -> Result<Vec<Credential>> {
        Ok(self.store.list()?)
    }

    pub fn counts(&self) -> Result<PoolCounts> {
        Ok(PoolCounts::from_credentials(&self.store.list()?, now_millis()))
    }

    /// Pool health summary for the health and admin endpoints.
    ///
    /// Status mapping: every credential usable → healthy, some usable →
    /// degraded, none usable → unhealthy. Never includes secrets.
    pub fn health(&self) -> Result<serde_json::Value> {
        let now = now_millis();
        let credentials = self.store.list()?;
        let counts = PoolCounts::from_credentials(&credentials, now);

        let status = if counts.total > 0 && counts.usable() == counts.total {
            "healthy"
        } else if counts.usable() > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let rows: Vec<serde_json::Value> = credentials
            .iter()
            .map(|c| credential_summary(c, now))
            .collect();

        let mut body = counts.to_json();
        body["status"] = serde_json::json!(status);
        body["credentials"] = serde_json::json!(rows);
        Ok(body)
    }
}

/// Public view of one credential: counters and timestamps, secret fingerprint only.
pub fn credential_summary(credential: &Credential, now: u64) -> serde_json::Value {
    let mut row = serde_json::json!({
        "id": credential.id,
        "status": credential.status.as_str(),
        "secret_fp": credential.secret.fingerprint(),
        "use_count": credential.use_count,
        "consecutive_failures": credential.consecutive_failures,
        "last_used_at": credential.last_used_at,
        "last_success_at": credential.last_success_at,
        "last_failure_at": credential.last_failure_at,
        "created_at": credential.created_at,
    });
    if credential.status == CredentialStatus::Cooldown {
        row["cooldown_remaining_secs"] =
            serde_json::json!(credential.cooldown_remaining(now).as_secs());
    }
    row
}

fn exhausted_message(counts: PoolCounts) -> String {
    serde_json::json!({
        "error": {
            "type": "pool_exhausted",
            "message": "No upstream credential available",
            "pool": counts.to_json()
        }
    })
    .to_string()
}
