pub mod api_client;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod mailbox;
pub mod profile_cache;
pub mod session_store;
pub mod storage;
