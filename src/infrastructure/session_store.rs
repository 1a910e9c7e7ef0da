use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    StoredUser,
    CurrentProfileId,
    IsBlocking,
    ProfileCatalog,
    AllowExceptions,
    LocalSessionProfileId,
}

impl SessionKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StoredUser => "stored_user",
            Self::CurrentProfileId => "current_profile_id",
            Self::IsBlocking => "is_blocking",
            Self::ProfileCatalog => "profile_catalog",
            Self::AllowExceptions => "allow_exceptions",
            Self::LocalSessionProfileId => "local_session_profile_id",
        }
    }

    pub const SIGN_OUT_KEYS: [SessionKey; 4] = [
        SessionKey::StoredUser,
        SessionKey::CurrentProfileId,
        SessionKey::ProfileCatalog,
        SessionKey::AllowExceptions,
    ];
}

/// Keyed persistence that must survive process restarts. Writes to distinct
/// keys are not transactional; callers accept the inconsistency window.
pub trait SessionStore: Send + Sync {
    fn save(&self, key: SessionKey, value: &str) -> Result<(), InfraError>;
    fn load(&self, key: SessionKey) -> Result<Option<String>, InfraError>;
    fn remove(&self, key: SessionKey) -> Result<(), InfraError>;

    /// Bulk removal used on sign-out. Refused outright while a blocking
    /// session is active so that discarding identity cannot lift a block.
    fn clear(&self, keys: &[SessionKey]) -> Result<(), InfraError> {
        if self.load_bool(SessionKey::IsBlocking)? {
            return Err(InfraError::SignOutBlocked);
        }
        for key in keys {
            self.remove(*key)?;
        }
        Ok(())
    }

    fn save_bool(&self, key: SessionKey, value: bool) -> Result<(), InfraError> {
        self.save(key, if value { "true" } else { "false" })
    }

    fn load_bool(&self, key: SessionKey) -> Result<bool, InfraError> {
        Ok(matches!(self.load(key)?.as_deref(), Some("true")))
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db_path: PathBuf,
}

impl SqliteSessionStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

impl SessionStore for SqliteSessionStore {
    fn save(&self, key: SessionKey, value: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO session_kv (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
            params![key.as_str(), value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load(&self, key: SessionKey) -> Result<Option<String>, InfraError> {
        let connection = self.connect()?;
        let value: Option<String> = connection
            .query_row(
                "SELECT value FROM session_kv WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn remove(&self, key: SessionKey) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "DELETE FROM session_kv WHERE key = ?1",
            params![key.as_str()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    values: Mutex<HashMap<SessionKey, String>>,
}

impl InMemorySessionStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionKey, String>>, InfraError> {
        self.values
            .lock()
            .map_err(|error| InfraError::Storage(format!("session store lock poisoned: {error}")))
    }
}

impl SessionStore for InMemorySessionStore {
    fn save(&self, key: SessionKey, value: &str) -> Result<(), InfraError> {
        self.lock()?.insert(key, value.to_string());
        Ok(())
    }

    fn load(&self, key: SessionKey) -> Result<Option<String>, InfraError> {
        Ok(self.lock()?.get(&key).cloned())
    }

    fn remove(&self, key: SessionKey) -> Result<(), InfraError> {
        self.lock()?.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("appfence-session-{}.sqlite", uuid::Uuid::new_v4()))
    }

    #[test]
    fn sqlite_store_round_trips_across_connections() {
        let path = temp_db();
        initialize_database(&path).expect("init db");

        let writer = SqliteSessionStore::new(&path);
        writer
            .save(SessionKey::CurrentProfileId, "srv-1")
            .expect("save");

        let reader = SqliteSessionStore::new(&path);
        assert_eq!(
            reader.load(SessionKey::CurrentProfileId).expect("load"),
            Some("srv-1".to_string())
        );

        reader.remove(SessionKey::CurrentProfileId).expect("remove");
        assert_eq!(reader.load(SessionKey::CurrentProfileId).expect("load"), None);
    }

    #[test]
    fn clear_is_refused_while_blocking_flag_is_set() {
        let store = InMemorySessionStore::default();
        store.save(SessionKey::StoredUser, "{}").expect("save user");
        store
            .save_bool(SessionKey::IsBlocking, true)
            .expect("save flag");

        let result = store.clear(&SessionKey::SIGN_OUT_KEYS);
        assert!(matches!(result, Err(InfraError::SignOutBlocked)));
        assert_eq!(
            store.load(SessionKey::StoredUser).expect("load"),
            Some("{}".to_string())
        );
    }

    #[test]
    fn clear_removes_keys_once_unblocked() {
        let store = InMemorySessionStore::default();
        store.save(SessionKey::StoredUser, "{}").expect("save user");
        store
            .save(SessionKey::CurrentProfileId, "srv-1")
            .expect("save id");
        store
            .save_bool(SessionKey::IsBlocking, false)
            .expect("save flag");

        store.clear(&SessionKey::SIGN_OUT_KEYS).expect("clear");
        assert_eq!(store.load(SessionKey::StoredUser).expect("load"), None);
        assert_eq!(store.load(SessionKey::CurrentProfileId).expect("load"), None);
        // the blocking flag itself is not part of the sign-out set
        assert!(!store.load_bool(SessionKey::IsBlocking).expect("flag"));
    }
}
