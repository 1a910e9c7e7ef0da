use crate::domain::models::{
    ApiToken, BlockingStatus, Profile, ProfileDraft, ProfileUpdate, RestrictedSet, User,
};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use std::collections::BTreeSet;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleAction {
    Start,
    Stop,
}

impl ToggleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub apple_user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[async_trait]
pub trait BlockingApiClient: Send + Sync {
    async fn register(&self, request: RegisterRequest) -> Result<ApiToken, InfraError>;
    async fn current_user(&self, access_token: &str) -> Result<User, InfraError>;

    async fn list_profiles(&self, access_token: &str) -> Result<Vec<Profile>, InfraError>;
    async fn create_profile(
        &self,
        access_token: &str,
        draft: &ProfileDraft,
        is_default: bool,
    ) -> Result<Profile, InfraError>;
    async fn update_profile(
        &self,
        access_token: &str,
        profile_id: &str,
        update: &ProfileUpdate,
    ) -> Result<Profile, InfraError>;
    async fn delete_profile(&self, access_token: &str, profile_id: &str) -> Result<(), InfraError>;

    async fn toggle_blocking(
        &self,
        access_token: &str,
        profile_id: &str,
        action: ToggleAction,
    ) -> Result<BlockingStatus, InfraError>;
    async fn blocking_status(&self, access_token: &str) -> Result<BlockingStatus, InfraError>;
    async fn restricted_apps(
        &self,
        access_token: &str,
        profile_id: &str,
    ) -> Result<RestrictedSet, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestBlockingApiClient {
    client: Client,
    base_url: Url,
}

impl ReqwestBlockingApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InfraError> {
        let base_url = Url::parse(base_url)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid server base url: {error}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| InfraError::RequestFailed(format!("failed building http client: {error}")))?;
        Ok(Self { client, base_url })
    }

    fn ensure_token(access_token: &str) -> Result<(), InfraError> {
        if access_token.trim().is_empty() {
            return Err(InfraError::NotAuthenticated);
        }
        Ok(())
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::RequestFailed(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|_| InfraError::InvalidConfig("server base URL cannot be a base".to_string()))?;
            for segment in segments {
                parts.push(segment);
            }
        }
        Ok(url)
    }

    fn http_error(status: reqwest::StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("server api error: http {}", status.as_u16())
        } else {
            format!("server api error: http {}; body={body}", status.as_u16())
        };
        InfraError::RequestFailed(message)
    }

    async fn read_success_body(
        response: reqwest::Response,
        context: &str,
    ) -> Result<String, InfraError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("failed reading {context} response: {error}")))?;

        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(body)
    }

    fn parse_body<T: serde::de::DeserializeOwned>(body: &str, context: &str) -> Result<T, InfraError> {
        serde_json::from_str(body)
            .map_err(|error| InfraError::InvalidResponse(format!("invalid {context} payload: {error}; body={body}")))
    }
}

#[derive(Debug, serde::Serialize)]
struct RegisterBody<'a> {
    apple_user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, serde::Deserialize)]
struct TokenResource {
    access_token: String,
    token_type: String,
}

#[derive(Debug, serde::Deserialize)]
struct UserResource {
    id: String,
    email: Option<String>,
    name: Option<String>,
    apple_user_id: String,
    is_active: bool,
}

impl From<UserResource> for User {
    fn from(resource: UserResource) -> Self {
        Self {
            id: resource.id,
            email: resource.email,
            name: resource.name,
            apple_user_id: resource.apple_user_id,
            is_active: resource.is_active,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct CreateProfileBody<'a> {
    name: &'a str,
    icon: &'a str,
    restricted_apps: Vec<&'a str>,
    restricted_categories: Vec<&'a str>,
    is_default: bool,
}

#[derive(Debug, serde::Serialize)]
struct UpdateProfileBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restricted_apps: Option<Vec<&'a str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restricted_categories: Option<Vec<&'a str>>,
}

impl<'a> UpdateProfileBody<'a> {
    fn from_update(update: &'a ProfileUpdate) -> Self {
        Self {
            name: update.name.as_option().map(String::as_str),
            icon: update.icon.as_option().map(String::as_str),
            restricted_apps: update
                .restricted_apps
                .as_option()
                .map(|apps| apps.iter().map(String::as_str).collect()),
            restricted_categories: update
                .restricted_categories
                .as_option()
                .map(|categories| categories.iter().map(String::as_str).collect()),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ProfileResource {
    id: String,
    name: String,
    icon: String,
    restricted_apps: Vec<String>,
    restricted_categories: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    is_default: bool,
}

impl From<ProfileResource> for Profile {
    fn from(resource: ProfileResource) -> Self {
        Self {
            id: resource.id,
            name: resource.name,
            icon: resource.icon,
            restricted_apps: resource.restricted_apps.into_iter().collect(),
            restricted_categories: resource.restricted_categories.into_iter().collect(),
            server_backed: true,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct ToggleBody<'a> {
    profile_id: &'a str,
    action: &'a str,
}

#[derive(Debug, serde::Deserialize)]
struct BlockingStatusResource {
    is_blocking: bool,
    profile_id: Option<String>,
    session_id: Option<String>,
    started_at: Option<String>,
}

impl BlockingStatusResource {
    fn into_status(self) -> Result<BlockingStatus, InfraError> {
        let started_at = match self.started_at.as_deref() {
            None => None,
            Some(raw) => Some(parse_server_timestamp(raw)?),
        };
        Ok(BlockingStatus {
            is_blocking: self.is_blocking,
            profile_id: self.profile_id,
            session_id: self.session_id,
            started_at,
        })
    }
}

#[derive(Debug, serde::Deserialize)]
struct RestrictedSetResource {
    restricted_apps: Vec<String>,
    restricted_categories: Vec<String>,
}

impl From<RestrictedSetResource> for RestrictedSet {
    fn from(resource: RestrictedSetResource) -> Self {
        Self {
            apps: resource.restricted_apps.into_iter().collect::<BTreeSet<_>>(),
            categories: resource
                .restricted_categories
                .into_iter()
                .collect::<BTreeSet<_>>(),
        }
    }
}

// The server emits RFC 3339 timestamps but older deployments omit the offset;
// those are interpreted as UTC.
fn parse_server_timestamp(raw: &str) -> Result<DateTime<Utc>, InfraError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|error| InfraError::InvalidResponse(format!("invalid timestamp '{raw}': {error}")))
}

#[async_trait]
impl BlockingApiClient for ReqwestBlockingApiClient {
    async fn register(&self, request: RegisterRequest) -> Result<ApiToken, InfraError> {
        Self::ensure_non_empty(&request.apple_user_id, "apple user id")?;

        let endpoint = self.endpoint(&["auth", "register"])?;
        let body = RegisterBody {
            apple_user_id: &request.apple_user_id,
            email: request.email.as_deref(),
            name: request.name.as_deref(),
        };

        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("network error while registering: {error}")))?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("failed reading register response: {error}")))?;

        if !status.is_success() {
            return Err(InfraError::AuthenticationFailed(format!(
                "registration rejected: http {}",
                status.as_u16()
            )));
        }

        let parsed: TokenResource = Self::parse_body(&response_body, "register")?;
        if parsed.access_token.trim().is_empty() {
            return Err(InfraError::InvalidResponse(
                "register response did not include an access token".to_string(),
            ));
        }

        Ok(ApiToken {
            access_token: parsed.access_token,
            token_type: parsed.token_type,
            obtained_at: Utc::now(),
        })
    }

    async fn current_user(&self, access_token: &str) -> Result<User, InfraError> {
        Self::ensure_token(access_token)?;

        let endpoint = self.endpoint(&["users", "me"])?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("network error while fetching user: {error}")))?;

        let body = Self::read_success_body(response, "user").await?;
        let parsed: UserResource = Self::parse_body(&body, "user")?;
        Ok(parsed.into())
    }

    async fn list_profiles(&self, access_token: &str) -> Result<Vec<Profile>, InfraError> {
        Self::ensure_token(access_token)?;

        let endpoint = self.endpoint(&["profiles"])?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("network error while listing profiles: {error}")))?;

        let body = Self::read_success_body(response, "profile list").await?;
        let parsed: Vec<ProfileResource> = Self::parse_body(&body, "profile list")?;
        Ok(parsed.into_iter().map(Profile::from).collect())
    }

    async fn create_profile(
        &self,
        access_token: &str,
        draft: &ProfileDraft,
        is_default: bool,
    ) -> Result<Profile, InfraError> {
        Self::ensure_token(access_token)?;
        draft.validate().map_err(InfraError::RequestFailed)?;

        let endpoint = self.endpoint(&["profiles"])?;
        let body = CreateProfileBody {
            name: &draft.name,
            icon: &draft.icon,
            restricted_apps: draft.restricted_apps.iter().map(String::as_str).collect(),
            restricted_categories: draft
                .restricted_categories
                .iter()
                .map(String::as_str)
                .collect(),
            is_default,
        };

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("network error while creating profile: {error}")))?;

        let response_body = Self::read_success_body(response, "profile create").await?;
        let parsed: ProfileResource = Self::parse_body(&response_body, "profile create")?;
        Ok(parsed.into())
    }

    async fn update_profile(
        &self,
        access_token: &str,
        profile_id: &str,
        update: &ProfileUpdate,
    ) -> Result<Profile, InfraError> {
        Self::ensure_token(access_token)?;
        Self::ensure_non_empty(profile_id, "profile id")?;

        let endpoint = self.endpoint(&["profiles", profile_id])?;
        let body = UpdateProfileBody::from_update(update);

        let response = self
            .client
            .put(endpoint)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("network error while updating profile: {error}")))?;

        let response_body = Self::read_success_body(response, "profile update").await?;
        let parsed: ProfileResource = Self::parse_body(&response_body, "profile update")?;
        Ok(parsed.into())
    }

    async fn delete_profile(&self, access_token: &str, profile_id: &str) -> Result<(), InfraError> {
        Self::ensure_token(access_token)?;
        Self::ensure_non_empty(profile_id, "profile id")?;

        let endpoint = self.endpoint(&["profiles", profile_id])?;
        let response = self
            .client
            .delete(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("network error while deleting profile: {error}")))?;

        let _ = Self::read_success_body(response, "profile delete").await?;
        Ok(())
    }

    async fn toggle_blocking(
        &self,
        access_token: &str,
        profile_id: &str,
        action: ToggleAction,
    ) -> Result<BlockingStatus, InfraError> {
        Self::ensure_token(access_token)?;
        Self::ensure_non_empty(profile_id, "profile id")?;

        let endpoint = self.endpoint(&["blocking", "toggle"])?;
        let body = ToggleBody {
            profile_id,
            action: action.as_str(),
        };

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("network error while toggling blocking: {error}")))?;

        let response_body = Self::read_success_body(response, "blocking toggle").await?;
        let parsed: BlockingStatusResource = Self::parse_body(&response_body, "blocking toggle")?;
        parsed.into_status()
    }

    async fn blocking_status(&self, access_token: &str) -> Result<BlockingStatus, InfraError> {
        Self::ensure_token(access_token)?;

        let endpoint = self.endpoint(&["blocking", "status"])?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("network error while fetching blocking status: {error}")))?;

        let body = Self::read_success_body(response, "blocking status").await?;
        let parsed: BlockingStatusResource = Self::parse_body(&body, "blocking status")?;
        parsed.into_status()
    }

    async fn restricted_apps(
        &self,
        access_token: &str,
        profile_id: &str,
    ) -> Result<RestrictedSet, InfraError> {
        Self::ensure_token(access_token)?;
        Self::ensure_non_empty(profile_id, "profile id")?;

        let endpoint = self.endpoint(&["profiles", profile_id, "restricted-apps"])?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|error| InfraError::RequestFailed(format!("network error while fetching restricted apps: {error}")))?;

        let body = Self::read_success_body(response, "restricted apps").await?;
        let parsed: RestrictedSetResource = Self::parse_body(&body, "restricted apps")?;
        Ok(parsed.into())
    }
}
