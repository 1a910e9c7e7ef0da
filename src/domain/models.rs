use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_PROFILE_NAME: &str = "Default";
pub const DEFAULT_PROFILE_ICON: &str = "bell.slash";

const PLACEHOLDER_BUNDLE_IDS: [&str; 2] = ["unknown.bundle", "uknown.bundle"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub restricted_apps: BTreeSet<String>,
    pub restricted_categories: BTreeSet<String>,
    pub server_backed: bool,
}

impl Profile {
    pub fn local(name: impl Into<String>, icon: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            icon: icon.into(),
            restricted_apps: BTreeSet::new(),
            restricted_categories: BTreeSet::new(),
            server_backed: false,
        }
    }

    pub fn default_local() -> Self {
        Self::local(DEFAULT_PROFILE_NAME, DEFAULT_PROFILE_ICON)
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_PROFILE_NAME
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "profile.id")?;
        validate_non_empty(&self.name, "profile.name")?;
        validate_non_empty(&self.icon, "profile.icon")?;
        for bundle_id in &self.restricted_apps {
            validate_non_empty(bundle_id, "profile.restricted_apps[]")?;
        }
        for category in &self.restricted_categories {
            validate_non_empty(category, "profile.restricted_categories[]")?;
        }
        Ok(())
    }

    pub fn restricted_set(&self) -> RestrictedSet {
        RestrictedSet {
            apps: self.restricted_apps.clone(),
            categories: self.restricted_categories.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfileDraft {
    pub name: String,
    pub icon: String,
    pub restricted_apps: BTreeSet<String>,
    pub restricted_categories: BTreeSet<String>,
}

impl ProfileDraft {
    pub fn new(name: impl Into<String>, icon: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            icon: icon.into(),
            restricted_apps: BTreeSet::new(),
            restricted_categories: BTreeSet::new(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.name, "profile.name")?;
        validate_non_empty(&self.icon, "profile.icon")?;
        Ok(())
    }
}

/// Distinguishes "leave this field alone" from "overwrite with this value" in
/// partial updates, instead of overloading null.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldUpdate<T> {
    #[default]
    Unset,
    SetTo(T),
}

impl<T> FieldUpdate<T> {
    pub fn is_set(&self) -> bool {
        matches!(self, Self::SetTo(_))
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Self::Unset => None,
            Self::SetTo(value) => Some(value),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: FieldUpdate<String>,
    pub icon: FieldUpdate<String>,
    pub restricted_apps: FieldUpdate<BTreeSet<String>>,
    pub restricted_categories: FieldUpdate<BTreeSet<String>>,
}

impl ProfileUpdate {
    pub fn is_noop(&self) -> bool {
        !self.name.is_set()
            && !self.icon.is_set()
            && !self.restricted_apps.is_set()
            && !self.restricted_categories.is_set()
    }

    pub fn restricted_apps(apps: BTreeSet<String>) -> Self {
        Self {
            restricted_apps: FieldUpdate::SetTo(apps),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub apple_user_id: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiToken {
    pub access_token: String,
    pub token_type: String,
    pub obtained_at: DateTime<Utc>,
}

impl ApiToken {
    pub fn is_usable(&self) -> bool {
        !self.access_token.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingStatus {
    pub is_blocking: bool,
    pub profile_id: Option<String>,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl BlockingStatus {
    pub fn stopped() -> Self {
        Self {
            is_blocking: false,
            profile_id: None,
            session_id: None,
            started_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictedSet {
    pub apps: BTreeSet<String>,
    pub categories: BTreeSet<String>,
}

impl RestrictedSet {
    pub fn empty() -> Self {
        Self {
            apps: BTreeSet::new(),
            categories: BTreeSet::new(),
        }
    }

    /// Enforcement set with allow exceptions filtered out of the app list.
    /// Categories are not subject to exceptions.
    pub fn effective(&self, exceptions: &BTreeSet<String>) -> RestrictedSet {
        RestrictedSet {
            apps: self.apps.difference(exceptions).cloned().collect(),
            categories: self.categories.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.categories.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailboxKind {
    PendingMessage,
    ShieldContext,
}

impl MailboxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingMessage => "pending_message_request",
            Self::ShieldContext => "shield_context",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxPayload {
    pub bundle_id: String,
    pub app_name: Option<String>,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockAttempt {
    pub bundle_id: String,
    pub app_name: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Bundle ids the shield extension writes when it could not resolve the real
/// one. These never belong in a restricted set.
pub fn is_placeholder_bundle(bundle_id: &str) -> bool {
    let bundle_id = bundle_id.trim();
    bundle_id.is_empty() || PLACEHOLDER_BUNDLE_IDS.contains(&bundle_id)
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
