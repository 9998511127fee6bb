//! Credential record and status

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;

use crate::error::Error;

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Lifecycle status of a credential row.
///
/// Transitions:
/// - Active → InFlight (pool acquisition)
/// - InFlight → Active (success, refresh, or caller cancellation)
/// - InFlight → Cooldown (upstream failure below the threshold)
/// - Cooldown → InFlight (acquired after the cooldown elapsed)
/// - any → Disabled (failure threshold exceeded, or operator action)
/// - Disabled/Cooldown → Active (operator re-enable only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialStatus {
    Active,
    InFlight,
    Cooldown,
    Disabled,
}

impl CredentialStatus {
    pub const ALL: [CredentialStatus; 4] = [
        CredentialStatus::Active,
        CredentialStatus::InFlight,
        CredentialStatus::Cooldown,
        CredentialStatus::Disabled,
    ];

    /// Stable label used in the database, health output, and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::InFlight => "in_flight",
            CredentialStatus::Cooldown => "cooldown",
            CredentialStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CredentialStatus::Active),
            "in_flight" => Ok(CredentialStatus::InFlight),
            "cooldown" => Ok(CredentialStatus::Cooldown),
            "disabled" => Ok(CredentialStatus::Disabled),
            other => Err(Error::Corrupt(format!("unknown credential status {other:?}"))),
        }
    }
}

/// One session credential and its bookkeeping.
///
/// Timestamps are unix milliseconds; `0` means "never". Instances handed out
/// by the store are snapshots: the row may change after the read.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub secret: Secret<String>,
    pub status: CredentialStatus,
    /// Set while `status` is `Cooldown`
    pub cooldown_until: Option<u64>,
    pub last_used_at: u64,
    pub last_success_at: u64,
    pub last_failure_at: u64,
    pub secret_updated_at: u64,
    pub consecutive_failures: u32,
    pub use_count: u64,
    pub created_at: u64,
}

impl Credential {
    /// Whether the pool may hand this credential out at `now`.
    pub fn is_eligible(&self, now: u64) -> bool {
        match self.status {
            CredentialStatus::Active => true,
            CredentialStatus::Cooldown => self.cooldown_until.is_none_or(|until| until <= now),
            CredentialStatus::InFlight | CredentialStatus::Disabled => false,
        }
    }

    /// Time left before a cooling credential becomes eligible again.
    pub fn cooldown_remaining(&self, now: u64) -> Duration {
        match (self.status, self.cooldown_until) {
            (CredentialStatus::Cooldown, Some(until)) if until > now => {
                Duration::from_millis(until - now)
            }
            _ => Duration::ZERO,
        }
    }
}
