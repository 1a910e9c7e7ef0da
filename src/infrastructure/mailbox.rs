use crate::domain::models::{BlockAttempt, MailboxKind, MailboxPayload};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DEFAULT_ATTEMPT_CAPACITY: usize = 100;

/// Single-slot relay between execution contexts that share no memory.
/// One pending payload per kind, last write wins, consume is read-and-clear.
pub trait MailboxRelay: Send + Sync {
    fn publish(&self, kind: MailboxKind, bundle_id: &str, app_name: Option<&str>)
    -> Result<(), InfraError>;
    fn consume(&self, kind: MailboxKind) -> Result<Option<MailboxPayload>, InfraError>;

    fn append_attempt(&self, bundle_id: &str, app_name: Option<&str>) -> Result<(), InfraError>;
    fn fetch_attempts(&self, max: usize) -> Result<Vec<BlockAttempt>, InfraError>;

    /// Most recently seen non-empty display name for a bundle id, used to
    /// backfill context when a payload carries a placeholder.
    fn latest_name_for(&self, bundle_id: &str) -> Result<Option<String>, InfraError> {
        let attempts = self.fetch_attempts(DEFAULT_ATTEMPT_CAPACITY)?;
        for attempt in attempts.iter().rev() {
            if attempt.bundle_id == bundle_id {
                if let Some(name) = attempt
                    .app_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                {
                    return Ok(Some(name.to_string()));
                }
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteMailboxRelay {
    db_path: PathBuf,
    attempt_capacity: usize,
}

impl SqliteMailboxRelay {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            attempt_capacity: DEFAULT_ATTEMPT_CAPACITY,
        }
    }

    pub fn with_attempt_capacity(mut self, attempt_capacity: usize) -> Self {
        self.attempt_capacity = attempt_capacity.max(1);
        self
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

impl MailboxRelay for SqliteMailboxRelay {
    fn publish(
        &self,
        kind: MailboxKind,
        bundle_id: &str,
        app_name: Option<&str>,
    ) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO mailbox_slots (kind, bundle_id, app_name, written_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind) DO UPDATE SET
               bundle_id = excluded.bundle_id,
               app_name = excluded.app_name,
               written_at = excluded.written_at",
            params![kind.as_str(), bundle_id, app_name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn consume(&self, kind: MailboxKind) -> Result<Option<MailboxPayload>, InfraError> {
        let mut connection = self.connect()?;
        // read and clear inside one transaction so a payload can never be
        // handed out twice; the write lock is taken up front so concurrent
        // consumers queue instead of deadlocking on a shared-lock upgrade
        let transaction =
            connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, Option<String>, String)> = transaction
            .query_row(
                "SELECT bundle_id, app_name, written_at FROM mailbox_slots WHERE kind = ?1",
                params![kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((bundle_id, app_name, written_at_raw)) = row else {
            transaction.commit()?;
            return Ok(None);
        };

        transaction.execute(
            "DELETE FROM mailbox_slots WHERE kind = ?1",
            params![kind.as_str()],
        )?;
        transaction.commit()?;

        Ok(Some(MailboxPayload {
            bundle_id,
            app_name,
            written_at: parse_timestamp(&written_at_raw)?,
        }))
    }

    fn append_attempt(&self, bundle_id: &str, app_name: Option<&str>) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        transaction.execute(
            "INSERT INTO block_attempts (bundle_id, app_name, attempted_at) VALUES (?1, ?2, ?3)",
            params![bundle_id, app_name, Utc::now().to_rfc3339()],
        )?;
        transaction.execute(
            "DELETE FROM block_attempts WHERE seq NOT IN
               (SELECT seq FROM block_attempts ORDER BY seq DESC LIMIT ?1)",
            params![self.attempt_capacity as i64],
        )?;
        transaction.commit()?;
        Ok(())
    }

    fn fetch_attempts(&self, max: usize) -> Result<Vec<BlockAttempt>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT bundle_id, app_name, attempted_at FROM block_attempts
             ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = statement.query_map(params![max as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut attempts = Vec::new();
        for row in rows {
            let (bundle_id, app_name, attempted_at_raw) = row?;
            attempts.push(BlockAttempt {
                bundle_id,
                app_name,
                attempted_at: parse_timestamp(&attempted_at_raw)?,
            });
        }
        // oldest first, matching the in-memory ring
        attempts.reverse();
        Ok(attempts)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| InfraError::Storage(format!("invalid mailbox timestamp '{raw}': {error}")))
}

#[derive(Debug)]
struct InMemoryMailboxState {
    slots: HashMap<MailboxKind, MailboxPayload>,
    attempts: VecDeque<BlockAttempt>,
}

#[derive(Debug)]
pub struct InMemoryMailboxRelay {
    state: Mutex<InMemoryMailboxState>,
    attempt_capacity: usize,
}

impl Default for InMemoryMailboxRelay {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPT_CAPACITY)
    }
}

impl InMemoryMailboxRelay {
    pub fn new(attempt_capacity: usize) -> Self {
        Self {
            state: Mutex::new(InMemoryMailboxState {
                slots: HashMap::new(),
                attempts: VecDeque::new(),
            }),
            attempt_capacity: attempt_capacity.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryMailboxState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::Storage(format!("mailbox lock poisoned: {error}")))
    }
}

impl MailboxRelay for InMemoryMailboxRelay {
    fn publish(
        &self,
        kind: MailboxKind,
        bundle_id: &str,
        app_name: Option<&str>,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.slots.insert(
            kind,
            MailboxPayload {
                bundle_id: bundle_id.to_string(),
                app_name: app_name.map(ToOwned::to_owned),
                written_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn consume(&self, kind: MailboxKind) -> Result<Option<MailboxPayload>, InfraError> {
        Ok(self.lock()?.slots.remove(&kind))
    }

    fn append_attempt(&self, bundle_id: &str, app_name: Option<&str>) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.attempts.push_back(BlockAttempt {
            bundle_id: bundle_id.to_string(),
            app_name: app_name.map(ToOwned::to_owned),
            attempted_at: Utc::now(),
        });
        while state.attempts.len() > self.attempt_capacity {
            state.attempts.pop_front();
        }
        Ok(())
    }

    fn fetch_attempts(&self, max: usize) -> Result<Vec<BlockAttempt>, InfraError> {
        let state = self.lock()?;
        let skip = state.attempts.len().saturating_sub(max);
        Ok(state.attempts.iter().skip(skip).cloned().collect())
    }
}
