pub mod error;
pub mod config;
pub mod storage;
pub mod identity;
pub mod api;
pub mod allergen;

pub use api::ApiClient;
pub use error::{AppError, AppResult, ErrorKind};
pub use identity::{SessionManager, SessionState};
