pub mod billing;
pub mod config;
pub mod error;
pub mod notifications;
pub mod owners;
pub mod payments;
pub mod provisioning;
pub mod routes;
pub mod servers;
pub mod store;

pub use error::{AppError, AppResult, ErrorKind};
