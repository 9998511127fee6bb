//! SQLite-backed credential store
//!
//! Every status or secret change is a single SQL statement (or one short
//! transaction) executed before the call returns, so the database is always
//! the current truth. The pool's at-most-one-holder guarantee rests on
//! `try_acquire` and `transition` being conditional updates: whichever caller
//! changes the row first wins and every other caller sees zero changed rows.
//!
//! A claim is identified by the `use_count` that `try_acquire` set. Every
//! write a holder makes when giving the row back (`record_outcome`,
//! `transition`) only applies while that claim is still current, so a holder
//! whose row was recovered and handed to someone else cannot settle the new
//! holder's claim.
//!
//! The connection sits behind a std `Mutex`. Statements are short and never
//! held across an await point.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use common::Secret;
use rusqlite::{Connection, OptionalExtension, Row, named_params, params};
use tracing::{debug, info, warn};

use crate::backup;
use crate::error::{Error, Result, is_constraint_violation};
use crate::model::{Credential, CredentialStatus, now_millis};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    id                   TEXT PRIMARY KEY,
    secret               TEXT NOT NULL UNIQUE,
    status               TEXT NOT NULL DEFAULT 'active',
    cooldown_until       INTEGER,
    last_used_at         INTEGER NOT NULL DEFAULT 0,
    last_success_at      INTEGER NOT NULL DEFAULT 0,
    last_failure_at      INTEGER NOT NULL DEFAULT 0,
    secret_updated_at    INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    use_count            INTEGER NOT NULL DEFAULT 0,
    created_at           INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_credentials_selection
    ON credentials (status, use_count, last_used_at);
";

const COLUMNS: &str = "id, secret, status, cooldown_until, last_used_at, last_success_at, \
     last_failure_at, secret_updated_at, consecutive_failures, use_count, created_at";

/// Predicate for rows the pool may claim at time `:now`.
const ELIGIBLE: &str = "(status = 'active' OR (status = 'cooldown' \
     AND (cooldown_until IS NULL OR cooldown_until <= :now)))";

/// Tunables for the store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// A credential is disabled once `consecutive_failures` exceeds this.
    pub failure_threshold: u32,
    /// `in_flight` rows older than this are reset to `active` on load.
    pub staleness_window: Duration,
    /// Plain-text secret backup, rewritten after every secret change.
    pub backup_path: Option<PathBuf>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            staleness_window: Duration::from_secs(600),
            backup_path: None,
        }
    }
}

/// Raw row before status parsing.
struct CredentialRow {
    id: String,
    secret: String,
    status: String,
    cooldown_until: Option<i64>,
    last_used_at: i64,
    last_success_at: i64,
    last_failure_at: i64,
    secret_updated_at: i64,
    consecutive_failures: i64,
    use_count: i64,
    created_at: i64,
}

impl CredentialRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            secret: row.get(1)?,
            status: row.get(2)?,
            cooldown_until: row.get(3)?,
            last_used_at: row.get(4)?,
            last_success_at: row.get(5)?,
            last_failure_at: row.get(6)?,
            secret_updated_at: row.get(7)?,
            consecutive_failures: row.get(8)?,
            use_count: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_credential(self) -> Result<Credential> {
        Ok(Credential {
            status: self.status.parse()?,
            id: self.id,
            secret: Secret::new(self.secret),
            cooldown_until: self.cooldown_until.map(from_sql_ms),
            last_used_at: from_sql_ms(self.last_used_at),
            last_success_at: from_sql_ms(self.last_success_at),
            last_failure_at: from_sql_ms(self.last_failure_at),
            secret_updated_at: from_sql_ms(self.secret_updated_at),
            consecutive_failures: u32::try_from(self.consecutive_failures).unwrap_or(u32::MAX),
            use_count: u64::try_from(self.use_count).unwrap_or(0),
            created_at: from_sql_ms(self.created_at),
        })
    }
}

fn to_sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_sql_ms(ms: i64) -> u64 {
    u64::try_from(ms).unwrap_or(0)
}

fn new_credential_id() -> String {
    format!("cred_{}", uuid::Uuid::new_v4().as_simple())
}

/// Predicate for the row still being held under claim `:claim`.
const HELD: &str = "status = 'in_flight' AND use_count = :claim";

/// Durable credential table.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    options: StoreOptions,
}

impl CredentialStore {
    /// Open (or create) the store at `path`.
    ///
    /// Fails with `Error::Corrupt` when the file is not a usable SQLite
    /// database or fails `PRAGMA quick_check`. Callers treat that as fatal.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Io(format!("creating database directory: {e}")))?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        conn.execute_batch("PRAGMA synchronous = FULL;")?;

        let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(Error::Corrupt(format!("quick_check reported: {check}")));
        }

        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "opened credential store");

        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    /// Lock the connection, recovering from a poisoned mutex.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("credential store lock poisoned, recovering");
                self.conn.clear_poison();
                poisoned.into_inner()
            }
        }
    }

    /// Startup load: reset stale `in_flight` rows, then return every row in
    /// insertion order.
    pub fn load(&self) -> Result<Vec<Credential>> {
        let recovered = self.recover_stale(now_millis())?;
        if recovered > 0 {
            warn!(recovered, "reset credentials left in_flight past the staleness window");
        }
        let credentials = self.list()?;
        info!(credentials = credentials.len(), "loaded credentials");
        Ok(credentials)
    }

    /// Reset `in_flight` rows whose `last_used_at` is older than the
    /// staleness window. Returns the number of rows reset.
    pub fn recover_stale(&self, now: u64) -> Result<usize> {
        let window = self.options.staleness_window.as_millis() as u64;
        let cutoff = now.saturating_sub(window);
        let conn = self.lock();
        let reset = conn.execute(
            "UPDATE credentials SET status = 'active', cooldown_until = NULL
             WHERE status = 'in_flight' AND last_used_at < ?1",
            params![to_sql_ms(cutoff)],
        )?;
        Ok(reset)
    }

    /// Every credential, in insertion order.
    pub fn list(&self) -> Result<Vec<Credential>> {
        let conn = self.lock();
        query_credentials(
            &conn,
            &format!("SELECT {COLUMNS} FROM credentials ORDER BY rowid"),
            params![],
        )
    }

    pub fn get(&self, id: &str) -> Result<Option<Credential>> {
        let conn = self.lock();
        get_locked(&conn, id)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Add a new credential. Returns `None` when the secret is already stored.
    pub fn insert(&self, secret: &str) -> Result<Option<Credential>> {
        let conn = self.lock();
        let inserted = insert_locked(&conn, secret, now_millis())?;
        if let Some(ref credential) = inserted {
            info!(
                credential_id = credential.id,
                secret_fp = credential.secret.fingerprint(),
                "credential added"
            );
            self.sync_backup_locked(&conn);
        }
        Ok(inserted)
    }

    /// Insert every secret from the backup file that is not stored yet.
    /// Returns the number of new credentials.
    pub fn import_backup(&self) -> Result<usize> {
        let Some(path) = self.options.backup_path.as_deref() else {
            return Ok(0);
        };
        let secrets = backup::read_secrets(path)?;

        let conn = self.lock();
        let now = now_millis();
        let mut imported = 0usize;
        for secret in &secrets {
            if insert_locked(&conn, secret, now)?.is_some() {
                imported += 1;
            }
        }
        self.sync_backup_locked(&conn);

        info!(
            path = %path.display(),
            read = secrets.len(),
            imported,
            "imported secret backup"
        );
        Ok(imported)
    }

    /// Replace a credential's secret. Last writer wins.
    ///
    /// Writing the secret a row already holds is a no-op apart from the
    /// timestamp, so repeated rotation signals are harmless.
    pub fn upsert_secret(&self, id: &str, secret: &str) -> Result<()> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(Error::EmptySecret);
        }

        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE credentials SET secret = ?2, secret_updated_at = MAX(secret_updated_at, ?3)
             WHERE id = ?1",
            params![id, secret, to_sql_ms(now_millis())],
        );
        let changed = match changed {
            Ok(n) => n,
            Err(e) if is_constraint_violation(&e) => {
                let owner: Option<String> = conn
                    .query_row(
                        "SELECT id FROM credentials WHERE secret = ?1",
                        params![secret],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(Error::DuplicateSecret(owner.unwrap_or_default()));
            }
            Err(e) => return Err(e.into()),
        };
        if changed == 0 {
            return Err(Error::NotFound(id.to_string()));
        }

        debug!(credential_id = id, "secret replaced");
        self.sync_backup_locked(&conn);
        Ok(())
    }

    /// Record the result of one upstream call made under `claim`.
    ///
    /// Success resets `consecutive_failures`. Failure increments it and, once
    /// it exceeds the failure threshold, moves the row to `disabled`. A
    /// disabled row stays disabled no matter how many outcomes follow.
    ///
    /// Returns `None` without touching the row when the claim is no longer
    /// current (the row was recovered, disabled, or claimed again).
    pub fn record_outcome(&self, id: &str, claim: u64, success: bool) -> Result<Option<Credential>> {
        let now = to_sql_ms(now_millis());
        let claim = to_sql_ms(claim);
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let changed = if success {
            tx.execute(
                &format!(
                    "UPDATE credentials
                     SET consecutive_failures = 0,
                         last_success_at = MAX(last_success_at, :now)
                     WHERE id = :id AND {HELD}"
                ),
                named_params! { ":id": id, ":now": now, ":claim": claim },
            )?
        } else {
            tx.execute(
                &format!(
                    "UPDATE credentials
                     SET consecutive_failures = consecutive_failures + 1,
                         last_failure_at = MAX(last_failure_at, :now),
                         status = CASE WHEN consecutive_failures + 1 > :threshold
                                       THEN 'disabled' ELSE status END
                     WHERE id = :id AND {HELD}"
                ),
                named_params! {
                    ":id": id,
                    ":now": now,
                    ":claim": claim,
                    ":threshold": i64::from(self.options.failure_threshold),
                },
            )?
        };

        let credential = get_locked(&tx, id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        tx.commit()?;
        if changed == 0 {
            return Ok(None);
        }

        if credential.status == CredentialStatus::Disabled && !success {
            warn!(
                credential_id = id,
                consecutive_failures = credential.consecutive_failures,
                threshold = self.options.failure_threshold,
                "credential disabled after repeated failures"
            );
        }
        Ok(Some(credential))
    }

    /// Rows the pool may claim at `now`, in selection order: fewest uses
    /// first, then longest idle.
    pub fn candidates(&self, now: u64) -> Result<Vec<Credential>> {
        let conn = self.lock();
        query_credentials(
            &conn,
            &format!(
                "SELECT {COLUMNS} FROM credentials
                 WHERE {ELIGIBLE}
                 ORDER BY use_count ASC, last_used_at ASC, rowid ASC"
            ),
            named_params! { ":now": to_sql_ms(now) },
        )
    }

    /// Claim a row for one request.
    ///
    /// A single conditional UPDATE moves the row to `in_flight`, bumps
    /// `use_count` and stamps `last_used_at`, but only while the row is still
    /// eligible. Returns the claimed snapshot, or `None` if another caller
    /// got there first.
    pub fn try_acquire(&self, id: &str, now: u64) -> Result<Option<Credential>> {
        let conn = self.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE credentials
                 SET status = 'in_flight',
                     use_count = use_count + 1,
                     last_used_at = MAX(last_used_at, :now),
                     cooldown_until = NULL
                 WHERE id = :id AND {ELIGIBLE}"
            ),
            named_params! { ":id": id, ":now": to_sql_ms(now) },
        )?;
        if changed != 1 {
            return Ok(None);
        }
        get_locked(&conn, id)
    }

    /// Give back a row held under `claim`, moving it from `in_flight` to `to`.
    ///
    /// Returns whether the row changed; `false` means the claim is no longer
    /// current. `cooldown_until` is written together with the status so a
    /// cooling row always carries its deadline.
    pub fn transition(
        &self,
        id: &str,
        claim: u64,
        to: CredentialStatus,
        cooldown_until: Option<u64>,
    ) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE credentials SET status = :to, cooldown_until = :until
                 WHERE id = :id AND {HELD}"
            ),
            named_params! {
                ":id": id,
                ":claim": to_sql_ms(claim),
                ":to": to.as_str(),
                ":until": cooldown_until.map(to_sql_ms),
            },
        )?;
        Ok(changed == 1)
    }

    /// Operator action: disable a credential regardless of its state.
    pub fn disable(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE credentials SET status = 'disabled', cooldown_until = NULL WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        info!(credential_id = id, "credential disabled by operator");
        Ok(())
    }

    /// Operator action: return a disabled or cooling credential to service
    /// with a clean failure count.
    ///
    /// Returns `false` when the row is active or in flight, which are left
    /// untouched so an in-flight holder is never disturbed.
    pub fn enable(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE credentials
             SET status = 'active', consecutive_failures = 0, cooldown_until = NULL
             WHERE id = ?1 AND status IN ('disabled', 'cooldown')",
            params![id],
        )?;
        if changed == 0 {
            return match get_locked(&conn, id)? {
                Some(_) => Ok(false),
                None => Err(Error::NotFound(id.to_string())),
            };
        }
        info!(credential_id = id, "credential re-enabled by operator");
        Ok(true)
    }

    /// Operator action: delete a credential row and drop it from the backup.
    pub fn remove(&self, id: &str) -> Result<Option<Credential>> {
        let conn = self.lock();
        let Some(existing) = get_locked(&conn, id)? else {
            return Ok(None);
        };
        conn.execute("DELETE FROM credentials WHERE id = ?1", params![id])?;
        info!(credential_id = id, "credential removed");
        self.sync_backup_locked(&conn);
        Ok(Some(existing))
    }

    /// Rewrite the backup file from the table. Failures are logged only:
    /// the database stays the source of truth.
    fn sync_backup_locked(&self, conn: &Connection) {
        let Some(path) = self.options.backup_path.as_deref() else {
            return;
        };
        let secrets = conn
            .prepare("SELECT secret FROM credentials ORDER BY rowid")
            .and_then(|mut stmt| {
                stmt.query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()
            });
        let result = match secrets {
            Ok(secrets) => backup::write_atomic(path, &secrets),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to rewrite secret backup");
        }
    }
}

fn insert_locked(conn: &Connection, secret: &str, now: u64) -> Result<Option<Credential>> {
    let secret = secret.trim();
    if secret.is_empty() {
        return Err(Error::EmptySecret);
    }
    let id = new_credential_id();
    let now = to_sql_ms(now);
    let changed = conn.execute(
        "INSERT OR IGNORE INTO credentials (id, secret, status, secret_updated_at, created_at)
         VALUES (?1, ?2, 'active', ?3, ?3)",
        params![id, secret, now],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    get_locked(conn, &id)
}

fn get_locked(conn: &Connection, id: &str) -> Result<Option<Credential>> {
    let row = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM credentials WHERE id = ?1"),
            params![id],
            CredentialRow::from_row,
        )
        .optional()?;
    row.map(CredentialRow::into_credential).transpose()
}

fn query_credentials(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Credential>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, CredentialRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(CredentialRow::into_credential).collect()
}
