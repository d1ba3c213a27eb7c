pub mod auth;
pub mod error;
pub mod health;
pub mod messages;
pub mod middleware;
pub mod moderation;
pub mod rate_limit;
pub mod reactions;
pub mod receipts;
pub mod rooms;
pub(crate) mod state;

pub use error::ApiError;
pub use rate_limit::RateLimiter;
pub use state::{AppState, AppStateInner};
