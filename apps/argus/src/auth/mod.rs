pub mod credential;
pub mod error;

pub use credential::{Argon2Scheme, Credential, CredentialScheme, KdfParams, Secret, SecretBinding};
pub use error::AuthError;
