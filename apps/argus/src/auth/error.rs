use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid kdf parameters: {0}")]
    Params(String),
    #[error("credential derivation failed: {0}")]
    Derive(String),
    #[error("password must not be empty")]
    EmptyPassword,
}
