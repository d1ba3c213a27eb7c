use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    ExpiredToken,
    #[error("unknown refresh token")]
    UnknownToken,
    #[error("refresh token reuse detected")]
    ReuseDetected,
    #[error("token store error: {0}")]
    Store(#[source] anyhow::Error),
    #[error("token signing error: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

impl TokenError {
    /// True for failures caused by the presented token rather than the server.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Store(_) | Self::Signing(_))
    }
}
