use crate::application::auth::AccountManager;
use crate::application::blocking::{BlockingSessionController, InMemoryEnforcementSink};
use crate::application::bootstrap::bootstrap_workspace;
use crate::application::profiles::ProfileService;
use crate::infrastructure::api_client::ReqwestBlockingApiClient;
use crate::infrastructure::config::{
    read_attempt_log_capacity, read_request_timeout_seconds, read_server_base_url,
    read_status_poll_seconds,
};
use crate::infrastructure::credential_store::KeychainCredentialStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::mailbox::SqliteMailboxRelay;
use crate::infrastructure::profile_cache::InMemoryProfileCacheRepository;
use crate::infrastructure::session_store::SqliteSessionStore;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type DefaultAccountManager =
    AccountManager<ReqwestBlockingApiClient, KeychainCredentialStore, SqliteSessionStore>;
pub type DefaultProfileService = ProfileService<
    ReqwestBlockingApiClient,
    InMemoryProfileCacheRepository,
    SqliteSessionStore,
    SqliteMailboxRelay,
>;
pub type DefaultBlockingController = BlockingSessionController<
    ReqwestBlockingApiClient,
    SqliteSessionStore,
    InMemoryEnforcementSink,
>;

/// Composition root. Wires the SQLite-backed stores, the keychain, the HTTP
/// client, and the services on top of them from a workspace directory.
pub struct AppServices {
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    status_poll: Duration,
    pub accounts: DefaultAccountManager,
    pub profiles: DefaultProfileService,
    pub blocking: DefaultBlockingController,
    pub mailbox: Arc<SqliteMailboxRelay>,
    pub enforcement: Arc<InMemoryEnforcementSink>,
    log_guard: Mutex<()>,
}

impl AppServices {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;

        let base_url = read_server_base_url(&bootstrap.config_dir)?;
        let timeout = Duration::from_secs(read_request_timeout_seconds(&bootstrap.config_dir)?);
        let status_poll = Duration::from_secs(read_status_poll_seconds(&bootstrap.config_dir)?);
        let attempt_capacity = read_attempt_log_capacity(&bootstrap.config_dir)?;

        let api_client = Arc::new(ReqwestBlockingApiClient::new(&base_url, timeout)?);
        let session_store = Arc::new(SqliteSessionStore::new(&bootstrap.database_path));
        let credential_store = Arc::new(KeychainCredentialStore::default());
        let mailbox = Arc::new(
            SqliteMailboxRelay::new(&bootstrap.database_path)
                .with_attempt_capacity(attempt_capacity),
        );
        let profile_cache = Arc::new(InMemoryProfileCacheRepository::default());
        let enforcement = Arc::new(InMemoryEnforcementSink::default());

        let accounts = AccountManager::new(
            Arc::clone(&api_client),
            credential_store,
            Arc::clone(&session_store),
        );
        let profiles = ProfileService::new(
            Arc::clone(&api_client),
            profile_cache,
            Arc::clone(&session_store),
            Arc::clone(&mailbox),
        );
        let blocking = BlockingSessionController::new(
            api_client,
            session_store,
            Arc::clone(&enforcement),
        );

        let services = Self {
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            logs_dir: bootstrap.logs_dir,
            status_poll,
            accounts,
            profiles,
            blocking,
            mailbox,
            enforcement,
            log_guard: Mutex::new(()),
        };
        services.restore()?;
        Ok(services)
    }

    /// Replays persisted state: catalog, current profile, and any session
    /// that was active when the previous process exited.
    fn restore(&self) -> Result<(), InfraError> {
        self.profiles.load_cached()?;
        self.profiles.ensure_default_exists()?;
        let catalog = self.profiles.cached_profiles()?;
        self.blocking.load_persisted(&catalog)?;
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn status_poll_interval(&self) -> Duration {
        self.status_poll
    }

    pub fn operation_error(&self, operation: &str, error: &InfraError) -> String {
        self.log_error(operation, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, operation: &str, message: &str) {
        self.append_log("info", operation, message);
    }

    pub fn log_error(&self, operation: &str, message: &str) {
        self.append_log("error", operation, message);
    }

    fn append_log(&self, level: &str, operation: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join("appfence.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "operation": operation,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }
}
