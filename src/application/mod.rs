pub mod auth;
pub mod blocking;
pub mod bootstrap;
pub mod profiles;
pub mod services;
