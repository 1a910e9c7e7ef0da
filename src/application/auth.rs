use crate::domain::models::{ApiToken, User};
use crate::infrastructure::api_client::{BlockingApiClient, RegisterRequest};
use crate::infrastructure::credential_store::CredentialStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::session_store::{SessionKey, SessionStore};
use std::sync::Arc;

/// Account lifecycle: registration against the server, token custody, and
/// sign-out. Sign-out is refused while a blocking session is active so that
/// dropping identity can never lift an enforced block.
pub struct AccountManager<C, K, S>
where
    C: BlockingApiClient,
    K: CredentialStore,
    S: SessionStore,
{
    api_client: Arc<C>,
    credential_store: Arc<K>,
    session_store: Arc<S>,
}

impl<C, K, S> AccountManager<C, K, S>
where
    C: BlockingApiClient,
    K: CredentialStore,
    S: SessionStore,
{
    pub fn new(api_client: Arc<C>, credential_store: Arc<K>, session_store: Arc<S>) -> Self {
        Self {
            api_client,
            credential_store,
            session_store,
        }
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<ApiToken, InfraError> {
        let token = self.api_client.register(request).await?;
        self.credential_store.save_token(&token)?;
        Ok(token)
    }

    pub fn require_token(&self) -> Result<ApiToken, InfraError> {
        match self.credential_store.load_token()? {
            Some(token) if token.is_usable() => Ok(token),
            _ => Err(InfraError::NotAuthenticated),
        }
    }

    pub fn is_signed_in(&self) -> bool {
        self.require_token().is_ok()
    }

    pub fn stored_user(&self) -> Result<Option<User>, InfraError> {
        let Some(raw) = self.session_store.load(SessionKey::StoredUser)? else {
            return Ok(None);
        };
        let user: User = serde_json::from_str(&raw)?;
        Ok(Some(user))
    }

    pub async fn refresh_stored_user(&self) -> Result<User, InfraError> {
        let token = self.require_token()?;
        let user = self.api_client.current_user(&token.access_token).await?;
        self.session_store
            .save(SessionKey::StoredUser, &serde_json::to_string(&user)?)?;
        Ok(user)
    }

    pub fn sign_out(&self) -> Result<(), InfraError> {
        if self.session_store.load_bool(SessionKey::IsBlocking)? {
            return Err(InfraError::SignOutBlocked);
        }
        self.session_store.clear(&SessionKey::SIGN_OUT_KEYS)?;
        self.credential_store.delete_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        BlockingStatus, Profile, ProfileDraft, ProfileUpdate, RestrictedSet,
    };
    use crate::infrastructure::api_client::ToggleAction;
    use crate::infrastructure::credential_store::InMemoryCredentialStore;
    use crate::infrastructure::session_store::InMemorySessionStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeApiClient {
        register_calls: AtomicUsize,
        reject_registration: bool,
    }

    #[async_trait]
    impl BlockingApiClient for FakeApiClient {
        async fn register(&self, request: RegisterRequest) -> Result<ApiToken, InfraError> {
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_registration {
                return Err(InfraError::AuthenticationFailed(
                    "registration rejected: http 403".to_string(),
                ));
            }
            Ok(ApiToken {
                access_token: format!("jwt-{}", request.apple_user_id),
                token_type: "bearer".to_string(),
                obtained_at: Utc::now(),
            })
        }

        async fn current_user(&self, access_token: &str) -> Result<User, InfraError> {
            Ok(User {
                id: "usr-1".to_string(),
                email: Some("user@example.com".to_string()),
                name: None,
                apple_user_id: access_token.trim_start_matches("jwt-").to_string(),
                is_active: true,
            })
        }

        async fn list_profiles(&self, _access_token: &str) -> Result<Vec<Profile>, InfraError> {
            Ok(Vec::new())
        }

        async fn create_profile(
            &self,
            _access_token: &str,
            _draft: &ProfileDraft,
            _is_default: bool,
        ) -> Result<Profile, InfraError> {
            Err(InfraError::RequestFailed("not implemented in fake".to_string()))
        }

        async fn update_profile(
            &self,
            _access_token: &str,
            _profile_id: &str,
            _update: &ProfileUpdate,
        ) -> Result<Profile, InfraError> {
            Err(InfraError::RequestFailed("not implemented in fake".to_string()))
        }

        async fn delete_profile(
            &self,
            _access_token: &str,
            _profile_id: &str,
        ) -> Result<(), InfraError> {
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

    fn manager(
        api: FakeApiClient,
    ) -> (
        AccountManager<FakeApiClient, InMemoryCredentialStore, InMemorySessionStore>,
        Arc<InMemoryCredentialStore>,
        Arc<InMemorySessionStore>,
    ) {
        let api = Arc::new(api);
        let credentials = Arc::new(InMemoryCredentialStore::default());
        let session = Arc::new(InMemorySessionStore::default());
        (
            AccountManager::new(api, Arc::clone(&credentials), Arc::clone(&session)),
            credentials,
            session,
        )
    }

    #[tokio::test]
    async fn register_stores_the_returned_token() {
        let (manager, credentials, _) = manager(FakeApiClient::default());

        let token = manager
            .register(RegisterRequest {
                apple_user_id: "apple-1".to_string(),
                email: None,
                name: None,
            })
            .await
            .expect("register");

        assert_eq!(token.access_token, "jwt-apple-1");
        assert_eq!(
            credentials.load_token().expect("load").map(|t| t.access_token),
            Some("jwt-apple-1".to_string())
        );
        assert!(manager.is_signed_in());
    }

    #[tokio::test]
    async fn rejected_registration_leaves_no_token_behind() {
        let (manager, credentials, _) = manager(FakeApiClient {
            reject_registration: true,
            ..FakeApiClient::default()
        });

        let result = manager
            .register(RegisterRequest {
                apple_user_id: "apple-1".to_string(),
                email: None,
                name: None,
            })
            .await;

        assert!(matches!(result, Err(InfraError::AuthenticationFailed(_))));
        assert!(credentials.load_token().expect("load").is_none());
        assert!(matches!(
            manager.require_token(),
            Err(InfraError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn sign_out_is_rejected_while_blocking_and_state_is_untouched() {
        let (manager, credentials, session) = manager(FakeApiClient::default());
        manager
            .register(RegisterRequest {
                apple_user_id: "apple-1".to_string(),
                email: None,
                name: None,
            })
            .await
            .expect("register");
        let user = manager.refresh_stored_user().await.expect("refresh user");
        session
            .save(SessionKey::CurrentProfileId, "p1")
            .expect("save current");
        session
            .save_bool(SessionKey::IsBlocking, true)
            .expect("save flag");

        assert!(matches!(manager.sign_out(), Err(InfraError::SignOutBlocked)));

        assert!(credentials.load_token().expect("load").is_some());
        assert_eq!(manager.stored_user().expect("stored user"), Some(user));
        assert_eq!(
            session.load(SessionKey::CurrentProfileId).expect("load"),
            Some("p1".to_string())
        );
        assert!(session.load_bool(SessionKey::IsBlocking).expect("flag"));
    }

    #[tokio::test]
    async fn sign_out_clears_identity_once_unblocked() {
        let (manager, credentials, session) = manager(FakeApiClient::default());
        manager
            .register(RegisterRequest {
                apple_user_id: "apple-1".to_string(),
                email: None,
                name: None,
            })
            .await
            .expect("register");
        manager.refresh_stored_user().await.expect("refresh user");
        session
            .save_bool(SessionKey::IsBlocking, false)
            .expect("save flag");

        manager.sign_out().expect("sign out");

        assert!(credentials.load_token().expect("load").is_none());
        assert_eq!(manager.stored_user().expect("stored user"), None);
        assert!(!manager.is_signed_in());
    }
}
