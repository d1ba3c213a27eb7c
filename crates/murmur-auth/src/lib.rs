mod error;
pub mod password;
pub mod tokens;

pub use error::TokenError;
pub use tokens::{Claims, TokenPair, TokenService, TokenType};
