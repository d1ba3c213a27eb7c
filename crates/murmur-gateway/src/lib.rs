pub mod connection;
mod error;
pub mod registry;
pub mod session;

pub use error::GatewayError;
pub use registry::{ConnSender, Outbound, Registry};
pub use session::{Flow, Gateway, PublishOutcome, Session, SessionState};
