pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::auth::AccountManager;
pub use application::blocking::{
    BlockingSessionController, BlockingSnapshot, EnforcementSink, SessionPhase,
};
pub use application::bootstrap::{BootstrapResult, bootstrap_workspace};
pub use application::profiles::{MergeOutcome, ProfileService};
pub use application::services::AppServices;
pub use domain::models::{
    ApiToken, BlockingStatus, MailboxKind, Profile, ProfileDraft, ProfileUpdate, RestrictedSet,
    User,
};
pub use infrastructure::error::InfraError;
