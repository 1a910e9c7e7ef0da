use crate::domain::models::{
    Profile, ProfileDraft, ProfileUpdate, is_placeholder_bundle,
};
use crate::infrastructure::api_client::BlockingApiClient;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::mailbox::MailboxRelay;
use crate::infrastructure::profile_cache::ProfileCacheRepository;
use crate::infrastructure::session_store::{SessionKey, SessionStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::{Duration as TokioDuration, sleep};

const MERGE_ATTEMPT_WINDOW: usize = 500;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

/// Outcome of pushing shield-observed bundle ids into the current server
/// profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No server-backed profile is current; nothing to merge into.
    NoServerProfile,
    /// Every observed bundle was already restricted.
    AlreadyCurrent,
    Merged { added: usize },
}

pub struct ProfileService<C, P, S, M>
where
    C: BlockingApiClient,
    P: ProfileCacheRepository,
    S: SessionStore,
    M: MailboxRelay,
{
    api_client: Arc<C>,
    cache: Arc<P>,
    session_store: Arc<S>,
    mailbox: Arc<M>,
    retry_policy: RetryPolicy,
}

impl<C, P, S, M> ProfileService<C, P, S, M>
where
    C: BlockingApiClient,
    P: ProfileCacheRepository,
    S: SessionStore,
    M: MailboxRelay,
{
    pub fn new(api_client: Arc<C>, cache: Arc<P>, session_store: Arc<S>, mailbox: Arc<M>) -> Self {
        Self {
            api_client,
            cache,
            session_store,
            mailbox,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Restores the catalog and current-profile pointer persisted by a
    /// previous run.
    pub fn load_cached(&self) -> Result<(), InfraError> {
        if let Some(raw) = self.session_store.load(SessionKey::ProfileCatalog)? {
            let profiles: Vec<Profile> = serde_json::from_str(&raw)?;
            self.cache.replace_all(profiles)?;
        }
        Ok(())
    }

    pub fn cached_profiles(&self) -> Result<Vec<Profile>, InfraError> {
        self.cache.list_all()
    }

    pub fn current_profile_id(&self) -> Result<Option<String>, InfraError> {
        self.session_store.load(SessionKey::CurrentProfileId)
    }

    /// Resolves the current profile, healing a dangling pointer: stored id,
    /// then the profile named "Default", then the first in catalog order.
    /// Returns `None` only for an empty catalog.
    pub fn current_profile(&self) -> Result<Option<Profile>, InfraError> {
        let profiles = self.cache.list_all()?;
        if profiles.is_empty() {
            return Ok(None);
        }

        let stored_id = self.current_profile_id()?;
        if let Some(stored_id) = stored_id.as_deref() {
            if let Some(profile) = profiles.iter().find(|profile| profile.id == stored_id) {
                return Ok(Some(profile.clone()));
            }
        }

        let healed = profiles
            .iter()
            .find(|profile| profile.is_default())
            .unwrap_or(&profiles[0])
            .clone();
        self.save_current_id(Some(&healed.id))?;
        Ok(Some(healed))
    }

    pub fn set_current(&self, profile_id: &str) -> Result<bool, InfraError> {
        if self.cache.get_by_id(profile_id)?.is_none() {
            return Ok(false);
        }
        self.save_current_id(Some(profile_id))?;
        Ok(true)
    }

    /// Startup guarantee: the app is usable offline, so an empty catalog gets
    /// a local "Default" profile with empty restriction sets.
    pub fn ensure_default_exists(&self) -> Result<Profile, InfraError> {
        if let Some(current) = self.current_profile()? {
            return Ok(current);
        }
        let default_profile = Profile::default_local();
        self.cache.upsert(&default_profile)?;
        self.save_current_id(Some(&default_profile.id))?;
        self.persist_catalog()?;
        Ok(default_profile)
    }

    /// Pulls the server catalog and merges by id: server entries are
    /// authoritative for server-backed profiles, local-only profiles are
    /// retained untouched. A failed pull keeps the previous cache.
    pub async fn refresh(&self, access_token: &str) -> Result<Vec<Profile>, InfraError> {
        let server_profiles = self.list_profiles_with_retry(access_token).await?;

        let cached = self.cache.list_all()?;
        let mut merged: Vec<Profile> = Vec::with_capacity(cached.len() + server_profiles.len());
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for profile in &cached {
            if !profile.server_backed {
                merged.push(profile.clone());
                continue;
            }
            if let Some(server_profile) = server_profiles
                .iter()
                .find(|candidate| candidate.id == profile.id)
            {
                merged.push(server_profile.clone());
                seen.insert(server_profile.id.clone());
            }
            // server-backed entries the server no longer reports are dropped
        }
        for server_profile in &server_profiles {
            if seen.insert(server_profile.id.clone()) {
                merged.push(server_profile.clone());
            }
        }

        self.cache.replace_all(merged.clone())?;
        self.persist_catalog()?;
        // heal the pointer if the refresh removed the current profile
        let _ = self.current_profile()?;
        Ok(merged)
    }

    /// Creates on the server first; the local catalog is only touched after
    /// the server acknowledged, so a failure leaves no orphaned entry
    /// claiming to be server-backed.
    pub async fn create(
        &self,
        access_token: &str,
        draft: ProfileDraft,
    ) -> Result<Profile, InfraError> {
        let created = self
            .api_client
            .create_profile(access_token, &draft, false)
            .await?;
        self.cache.upsert(&created)?;
        self.save_current_id(Some(&created.id))?;
        self.persist_catalog()?;
        Ok(created)
    }

    /// Partial update; the server response replaces the cached entry
    /// wholesale to avoid stale-field drift.
    pub async fn update(
        &self,
        access_token: &str,
        profile_id: &str,
        update: ProfileUpdate,
    ) -> Result<Profile, InfraError> {
        let updated = self
            .api_client
            .update_profile(access_token, profile_id, &update)
            .await?;
        self.cache.upsert(&updated)?;
        self.persist_catalog()?;
        Ok(updated)
    }

    /// Deletes on the server, then locally. Deleting the current profile
    /// promotes a remaining one, preferring server-backed entries.
    pub async fn delete(&self, access_token: &str, profile_id: &str) -> Result<(), InfraError> {
        let profile = self.cache.get_by_id(profile_id)?;
        if profile.as_ref().is_some_and(|profile| profile.server_backed) {
            self.api_client
                .delete_profile(access_token, profile_id)
                .await?;
        }
        self.cache.remove(profile_id)?;

        if self.current_profile_id()?.as_deref() == Some(profile_id) {
            let remaining = self.cache.list_all()?;
            let promoted = remaining
                .iter()
                .find(|candidate| candidate.server_backed)
                .or_else(|| remaining.first());
            self.save_current_id(promoted.map(|profile| profile.id.as_str()))?;
        }
        self.persist_catalog()?;
        Ok(())
    }

    /// Adds a profile that exists only on this device and makes it current.
    pub fn add_local(&self, draft: ProfileDraft) -> Result<Profile, InfraError> {
        draft.validate().map_err(InfraError::Storage)?;
        let mut profile = Profile::local(draft.name, draft.icon);
        profile.restricted_apps = draft.restricted_apps;
        profile.restricted_categories = draft.restricted_categories;

        self.cache.upsert(&profile)?;
        self.save_current_id(Some(&profile.id))?;
        self.persist_catalog()?;
        Ok(profile)
    }

    /// Applies a partial update to a local-only profile. Server-backed
    /// profiles change through `update` so the server stays authoritative.
    pub fn update_local(
        &self,
        profile_id: &str,
        update: &ProfileUpdate,
    ) -> Result<Profile, InfraError> {
        let Some(mut profile) = self.cache.get_by_id(profile_id)? else {
            return Err(InfraError::Storage(format!(
                "no cached profile '{profile_id}'"
            )));
        };
        if profile.server_backed {
            return Err(InfraError::Storage(format!(
                "profile '{profile_id}' is server-backed"
            )));
        }

        if let Some(name) = update.name.as_option() {
            profile.name = name.clone();
        }
        if let Some(icon) = update.icon.as_option() {
            profile.icon = icon.clone();
        }
        if let Some(apps) = update.restricted_apps.as_option() {
            profile.restricted_apps = apps.clone();
        }
        if let Some(categories) = update.restricted_categories.as_option() {
            profile.restricted_categories = categories.clone();
        }
        profile.validate().map_err(InfraError::Storage)?;

        self.cache.upsert(&profile)?;
        self.persist_catalog()?;
        Ok(profile)
    }

    pub fn delete_all_non_default(&self) -> Result<(), InfraError> {
        let profiles = self.cache.list_all()?;
        for profile in &profiles {
            if !profile.is_default() {
                self.cache.remove(&profile.id)?;
            }
        }
        let _ = self.current_profile()?;
        self.persist_catalog()?;
        Ok(())
    }

    /// Unions bundle ids observed by the shield into the current server
    /// profile's restricted set. Monotonic (never removes) and idempotent: a
    /// second run over the same attempt log changes nothing and sends no
    /// update.
    pub async fn merge_observed_bundles(
        &self,
        access_token: &str,
    ) -> Result<MergeOutcome, InfraError> {
        let attempts = self.mailbox.fetch_attempts(MERGE_ATTEMPT_WINDOW)?;
        let observed: BTreeSet<String> = attempts
            .into_iter()
            .map(|attempt| attempt.bundle_id)
            .filter(|bundle_id| !is_placeholder_bundle(bundle_id))
            .collect();
        if observed.is_empty() {
            return Ok(MergeOutcome::AlreadyCurrent);
        }

        let Some(current) = self.current_profile()? else {
            return Ok(MergeOutcome::NoServerProfile);
        };
        if !current.server_backed {
            return Ok(MergeOutcome::NoServerProfile);
        }

        // re-read from the server so the union starts from the authoritative set
        let server_profiles = self.list_profiles_with_retry(access_token).await?;
        let Some(server_profile) = server_profiles
            .iter()
            .find(|candidate| candidate.id == current.id)
        else {
            return Ok(MergeOutcome::NoServerProfile);
        };

        let mut merged = server_profile.restricted_apps.clone();
        let before = merged.len();
        merged.extend(observed);
        let added = merged.len() - before;
        if added == 0 {
            return Ok(MergeOutcome::AlreadyCurrent);
        }

        self.update(
            access_token,
            &server_profile.id,
            ProfileUpdate::restricted_apps(merged),
        )
        .await?;
        Ok(MergeOutcome::Merged { added })
    }

    fn save_current_id(&self, profile_id: Option<&str>) -> Result<(), InfraError> {
        match profile_id {
            Some(profile_id) => self
                .session_store
                .save(SessionKey::CurrentProfileId, profile_id),
            None => self.session_store.remove(SessionKey::CurrentProfileId),
        }
    }

    fn persist_catalog(&self) -> Result<(), InfraError> {
        let profiles = self.cache.list_all()?;
        self.session_store
            .save(SessionKey::ProfileCatalog, &serde_json::to_string(&profiles)?)
    }

    async fn list_profiles_with_retry(
        &self,
        access_token: &str,
    ) -> Result<Vec<Profile>, InfraError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match self.api_client.list_profiles(access_token).await {
                Ok(profiles) => return Ok(profiles),
                Err(error) if error.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt as u32));
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ApiToken, BlockingStatus, RestrictedSet, User};
    use crate::infrastructure::api_client::{RegisterRequest, ToggleAction};
    use crate::infrastructure::mailbox::InMemoryMailboxRelay;
    use crate::infrastructure::profile_cache::InMemoryProfileCacheRepository;
    use crate::infrastructure::session_store::InMemorySessionStore;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn server_profile(id: &str, name: &str, apps: &[&str]) -> Profile {
        Profile {
            id: id.to_string(),
            name: name.to_string(),
            icon: "bell.slash".to_string(),
            restricted_apps: apps.iter().map(|app| app.to_string()).collect(),
            restricted_categories: BTreeSet::new(),
            server_backed: true,
        }
    }

    #[derive(Debug, Default)]
    struct FakeApiClient {
        list_responses: Mutex<VecDeque<Result<Vec<Profile>, InfraError>>>,
        create_responses: Mutex<VecDeque<Result<Profile, InfraError>>>,
        update_responses: Mutex<VecDeque<Result<Profile, InfraError>>>,
        list_calls: AtomicUsize,
        update_calls: AtomicUsize,
        delete_calls: AtomicUsize,
    }

    impl FakeApiClient {
        fn push_list(&self, response: Result<Vec<Profile>, InfraError>) {
            self.list_responses
                .lock()
                .expect("list lock")
                .push_back(response);
        }

        fn push_create(&self, response: Result<Profile, InfraError>) {
            self.create_responses
                .lock()
                .expect("create lock")
                .push_back(response);
        }

        fn push_update(&self, response: Result<Profile, InfraError>) {
            self.update_responses
                .lock()
                .expect("update lock")
                .push_back(response);
        }
    }

    #[async_trait]
    impl BlockingApiClient for FakeApiClient {
        async fn register(&self, _request: RegisterRequest) -> Result<ApiToken, InfraError> {
            Err(InfraError::RequestFailed("not implemented in fake".to_string()))
        }

        async fn current_user(&self, _access_token: &str) -> Result<User, InfraError> {
            Err(InfraError::RequestFailed("not implemented in fake".to_string()))
        }

        async fn list_profiles(&self, _access_token: &str) -> Result<Vec<Profile>, InfraError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.list_responses
                .lock()
                .expect("list lock")
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn create_profile(
            &self,
            _access_token: &str,
            draft: &ProfileDraft,
            _is_default: bool,
        ) -> Result<Profile, InfraError> {
            self.create_responses
                .lock()
                .expect("create lock")
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(Profile {
                        id: format!("srv-{}", draft.name.to_ascii_lowercase()),
                        name: draft.name.clone(),
                        icon: draft.icon.clone(),
                        restricted_apps: draft.restricted_apps.clone(),
                        restricted_categories: draft.restricted_categories.clone(),
                        server_backed: true,
                    })
                })
        }

        async fn update_profile(
            &self,
            _access_token: &str,
            profile_id: &str,
            update: &ProfileUpdate,
        ) -> Result<Profile, InfraError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            self.update_responses
                .lock()
                .expect("update lock")
                .pop_front()
                .unwrap_or_else(|| {
                    let mut profile = server_profile(profile_id, "Updated", &[]);
                    if let Some(apps) = update.restricted_apps.as_option() {
                        profile.restricted_apps = apps.clone();
                    }
                    if let Some(name) = update.name.as_option() {
                        profile.name = name.clone();
                    }
                    Ok(profile)
                })
        }

        async fn delete_profile(
            &self,
            _access_token: &str,
            _profile_id: &str,
        ) -> Result<(), InfraError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn toggle_blocking(
            &self,
            _access_token: &str,
            _profile_id: &str,
            _action: ToggleAction,
        ) -> Result<BlockingStatus, InfraError> {
            Ok(BlockingStatus::stopped())
        }

        async fn blocking_status(&self, _access_token: &str) -> Result<BlockingStatus, InfraError> {
            Ok(BlockingStatus::stopped())
        }

        async fn restricted_apps(
            &self,
            _access_token: &str,
            _profile_id: &str,
        ) -> Result<RestrictedSet, InfraError> {
            Ok(RestrictedSet::empty())
        }
    }

    type TestService = ProfileService<
        FakeApiClient,
        InMemoryProfileCacheRepository,
        InMemorySessionStore,
        InMemoryMailboxRelay,
    >;

    struct Harness {
        service: TestService,
        api: Arc<FakeApiClient>,
        session: Arc<InMemorySessionStore>,
        mailbox: Arc<InMemoryMailboxRelay>,
    }

    fn harness() -> Harness {
        let api = Arc::new(FakeApiClient::default());
        let cache = Arc::new(InMemoryProfileCacheRepository::default());
        let session = Arc::new(InMemorySessionStore::default());
        let mailbox = Arc::new(InMemoryMailboxRelay::default());
        let service = ProfileService::new(
            Arc::clone(&api),
            cache,
            Arc::clone(&session),
            Arc::clone(&mailbox),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 1,
        });
        Harness {
            service,
            api,
            session,
            mailbox,
        }
    }

    #[test]
    fn ensure_default_creates_a_usable_offline_catalog() {
        let harness = harness();
        let default_profile = harness.service.ensure_default_exists().expect("ensure");

        assert!(default_profile.is_default());
        assert!(!default_profile.server_backed);
        assert_eq!(
            harness.service.current_profile_id().expect("current id"),
            Some(default_profile.id.clone())
        );
        // idempotent
        let again = harness.service.ensure_default_exists().expect("ensure again");
        assert_eq!(again.id, default_profile.id);
        assert_eq!(harness.service.cached_profiles().expect("list").len(), 1);
    }

    #[test]
    fn dangling_current_pointer_heals_to_default_then_first() {
        let harness = harness();
        let cache_seed = [
            server_profile("srv-1", "Focus", &[]),
            server_profile("srv-2", "Default", &[]),
        ];
        for profile in &cache_seed {
            harness.service.cache.upsert(profile).expect("seed");
        }
        harness
            .session
            .save(SessionKey::CurrentProfileId, "gone")
            .expect("save dangling");

        let healed = harness
            .service
            .current_profile()
            .expect("resolve")
            .expect("profile");
        assert_eq!(healed.id, "srv-2");
        assert_eq!(
            harness.service.current_profile_id().expect("current id"),
            Some("srv-2".to_string())
        );
    }

    #[tokio::test]
    async fn failed_create_leaves_catalog_untouched() {
        let harness = harness();
        harness.service.ensure_default_exists().expect("ensure");
        harness
            .api
            .push_create(Err(InfraError::RequestFailed("http 500".to_string())));

        let before = harness.service.cached_profiles().expect("list");
        let result = harness
            .service
            .create("jwt", ProfileDraft::new("Focus", "moon"))
            .await;

        assert!(matches!(result, Err(InfraError::RequestFailed(_))));
        assert_eq!(harness.service.cached_profiles().expect("list"), before);
    }

    #[tokio::test]
    async fn create_appends_and_becomes_current() {
        let harness = harness();
        harness.service.ensure_default_exists().expect("ensure");

        let created = harness
            .service
            .create("jwt", ProfileDraft::new("Focus", "moon"))
            .await
            .expect("create");

        assert!(created.server_backed);
        assert_eq!(
            harness.service.current_profile_id().expect("current id"),
            Some(created.id)
        );
        assert_eq!(harness.service.cached_profiles().expect("list").len(), 2);
    }

    #[tokio::test]
    async fn deleting_current_promotes_server_backed_first() {
        let harness = harness();
        let local = Profile::local("Scratch", "bell.slash");
        harness.service.cache.upsert(&local).expect("seed local");
        harness
            .service
            .cache
            .upsert(&server_profile("srv-1", "Focus", &[]))
            .expect("seed server");
        harness
            .service
            .cache
            .upsert(&server_profile("srv-2", "Work", &[]))
            .expect("seed server 2");
        harness.service.set_current("srv-1").expect("set current");

        harness.service.delete("jwt", "srv-1").await.expect("delete");

        // promotion prefers a server-backed profile over the earlier local one
        assert_eq!(
            harness.service.current_profile_id().expect("current id"),
            Some("srv-2".to_string())
        );
        assert_eq!(harness.api.delete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deleting_a_local_profile_skips_the_server() {
        let harness = harness();
        let local = Profile::local("Scratch", "bell.slash");
        harness.service.cache.upsert(&local).expect("seed local");
        harness.service.set_current(&local.id).expect("set current");

        harness.service.delete("jwt", &local.id).await.expect("delete");

        assert_eq!(harness.api.delete_calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.service.current_profile_id().expect("current id"), None);
    }

    #[tokio::test]
    async fn refresh_merges_server_catalog_and_keeps_local_profiles() {
        let harness = harness();
        let local = Profile::local("Scratch", "bell.slash");
        harness.service.cache.upsert(&local).expect("seed local");
        harness
            .service
            .cache
            .upsert(&server_profile("srv-old", "Stale", &[]))
            .expect("seed stale");
        harness.api.push_list(Ok(vec![
            server_profile("srv-1", "Focus", &["com.example.social"]),
        ]));

        let merged = harness.service.refresh("jwt").await.expect("refresh");

        let ids: Vec<&str> = merged.iter().map(|profile| profile.id.as_str()).collect();
        assert_eq!(ids, vec![local.id.as_str(), "srv-1"]);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_cache() {
        let harness = harness();
        harness
            .service
            .cache
            .upsert(&server_profile("srv-1", "Focus", &[]))
            .expect("seed");
        harness
            .api
            .push_list(Err(InfraError::RequestFailed("http 502".to_string())));

        let result = harness.service.refresh("jwt").await;
        assert!(result.is_err());
        assert_eq!(harness.service.cached_profiles().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn update_replaces_cached_entry_wholesale() {
        let harness = harness();
        harness
            .service
            .cache
            .upsert(&server_profile("srv-1", "Focus", &["com.example.a"]))
            .expect("seed");
        harness.api.push_update(Ok(server_profile(
            "srv-1",
            "Deep Focus",
            &["com.example.b"],
        )));

        let update = ProfileUpdate {
            name: crate::domain::models::FieldUpdate::SetTo("Deep Focus".to_string()),
            ..ProfileUpdate::default()
        };
        harness
            .service
            .update("jwt", "srv-1", update)
            .await
            .expect("update");

        let cached = harness
            .service
            .cache
            .get_by_id("srv-1")
            .expect("get")
            .expect("cached");
        assert_eq!(cached.name, "Deep Focus");
        // server response wins even for fields the update did not touch
        assert!(cached.restricted_apps.contains("com.example.b"));
        assert!(!cached.restricted_apps.contains("com.example.a"));
    }

    #[tokio::test]
    async fn merge_observed_bundles_is_idempotent_and_skips_placeholders() {
        let harness = harness();
        harness
            .service
            .cache
            .upsert(&server_profile("srv-1", "Focus", &["com.example.a"]))
            .expect("seed");
        harness.service.set_current("srv-1").expect("set current");

        for bundle in ["com.example.b", "unknown.bundle", "uknown.bundle", ""] {
            harness.mailbox.append_attempt(bundle, None).expect("append");
        }

        harness
            .api
            .push_list(Ok(vec![server_profile("srv-1", "Focus", &["com.example.a"])]));
        let first = harness
            .service
            .merge_observed_bundles("jwt")
            .await
            .expect("merge");
        assert_eq!(first, MergeOutcome::Merged { added: 1 });
        assert_eq!(harness.api.update_calls.load(Ordering::SeqCst), 1);

        // second pass over the same attempts: the server already has the union
        harness.api.push_list(Ok(vec![server_profile(
            "srv-1",
            "Focus",
            &["com.example.a", "com.example.b"],
        )]));
        let second = harness
            .service
            .merge_observed_bundles("jwt")
            .await
            .expect("merge again");
        assert_eq!(second, MergeOutcome::AlreadyCurrent);
        assert_eq!(harness.api.update_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn merge_without_server_profile_reports_no_target() {
        let harness = harness();
        harness.service.ensure_default_exists().expect("ensure");
        harness
            .mailbox
            .append_attempt("com.example.b", None)
            .expect("append");

        let outcome = harness
            .service
            .merge_observed_bundles("jwt")
            .await
            .expect("merge");
        assert_eq!(outcome, MergeOutcome::NoServerProfile);
        assert_eq!(harness.api.list_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn local_profiles_are_added_and_edited_without_the_network() {
        let harness = harness();
        let mut draft = ProfileDraft::new("Offline", "airplane");
        draft.restricted_apps.insert("com.example.social".to_string());

        let added = harness.service.add_local(draft).expect("add local");
        assert!(!added.server_backed);
        assert_eq!(
            harness.service.current_profile_id().expect("current id"),
            Some(added.id.clone())
        );

        let update = ProfileUpdate {
            icon: crate::domain::models::FieldUpdate::SetTo("moon".to_string()),
            ..ProfileUpdate::default()
        };
        let edited = harness
            .service
            .update_local(&added.id, &update)
            .expect("update local");
        assert_eq!(edited.icon, "moon");
        assert!(edited.restricted_apps.contains("com.example.social"));
    }

    #[test]
    fn update_local_refuses_server_backed_profiles() {
        let harness = harness();
        harness
            .service
            .cache
            .upsert(&server_profile("srv-1", "Focus", &[]))
            .expect("seed");

        let result = harness
            .service
            .update_local("srv-1", &ProfileUpdate::default());
        assert!(matches!(result, Err(InfraError::Storage(_))));
    }

    #[test]
    fn delete_all_non_default_keeps_only_the_default_profile() {
        let harness = harness();
        harness.service.ensure_default_exists().expect("ensure");
        harness
            .service
            .cache
            .upsert(&server_profile("srv-1", "Focus", &[]))
            .expect("seed");
        harness.service.set_current("srv-1").expect("set current");

        harness.service.delete_all_non_default().expect("wipe");

        let remaining = harness.service.cached_profiles().expect("list");
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].is_default());
        let healed = harness
            .service
            .current_profile()
            .expect("resolve")
            .expect("profile");
        assert!(healed.is_default());
    }

    #[test]
    fn catalog_round_trips_through_the_session_store() {
        let first_run = harness();
        first_run.service.ensure_default_exists().expect("ensure");
        first_run
            .service
            .cache
            .upsert(&server_profile("srv-1", "Focus", &["com.example.a"]))
            .expect("seed");
        first_run.service.persist_catalog().expect("persist");

        let second_service = ProfileService::new(
            Arc::new(FakeApiClient::default()),
            Arc::new(InMemoryProfileCacheRepository::default()),
            Arc::clone(&first_run.session),
            Arc::new(InMemoryMailboxRelay::default()),
        );
        second_service.load_cached().expect("load");
        assert_eq!(second_service.cached_profiles().expect("list").len(), 2);
    }

    proptest! {
        // after any interleaving of creates and deletes the current pointer
        // resolves to a member of the catalog whenever the catalog is non-empty
        #[test]
        fn current_profile_always_resolves(ops in proptest::collection::vec(any::<bool>(), 1..24)) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let harness = harness();
                let mut counter = 0u32;

                for is_create in ops {
                    if is_create {
                        counter += 1;
                        let _ = harness
                            .service
                            .create("jwt", ProfileDraft::new(format!("P{counter}"), "moon"))
                            .await
                            .expect("create");
                    } else if let Some(current) = harness.service.current_profile().expect("resolve") {
                        harness.service.delete("jwt", &current.id).await.expect("delete");
                    }

                    let profiles = harness.service.cached_profiles().expect("list");
                    let resolved = harness.service.current_profile().expect("resolve");
                    match resolved {
                        Some(profile) => {
                            assert!(profiles.iter().any(|candidate| candidate.id == profile.id));
                        }
                        None => assert!(profiles.is_empty()),
                    }
                }
            });
        }
    }
}
