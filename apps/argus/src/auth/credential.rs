use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, ParamsBuilder, Version};
use rand::{RngCore, rngs::OsRng};
use std::fmt;

use super::error::AuthError;
use crate::model::Site;

/// Upper bound on the memory cost a peer may ask us to spend verifying a
/// credential. Anything above is treated as a mismatch.
const MAX_VERIFY_MEMORY_KIB: u32 = 64 * 1024;
const MAX_VERIFY_ITERATIONS: u32 = 8;

/// What the derived credential is bound to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SecretBinding {
    #[default]
    PasswordOnly,
    SiteAndPassword,
}

/// The shared secret a sensor checks incoming credentials against and a viewer
/// derives its credential from.
#[derive(Clone)]
pub struct Secret {
    site: Site,
    password: String,
    binding: SecretBinding,
}

impl Secret {
    pub fn new(site: Site, password: impl Into<String>, binding: SecretBinding) -> Result<Self, AuthError> {
        let password = password.into();
        if password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }
        Ok(Self {
            site,
            password,
            binding,
        })
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    fn material(&self) -> Vec<u8> {
        match self.binding {
            SecretBinding::PasswordOnly => self.password.as_bytes().to_vec(),
            SecretBinding::SiteAndPassword => {
                let mut material = self.site.as_str().as_bytes().to_vec();
                material.extend_from_slice(self.password.as_bytes());
                material
            }
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("site", &self.site)
            .field("password", &"<redacted>")
            .field("binding", &self.binding)
            .finish()
    }
}

/// One-way value derived from a [`Secret`]; safe to put on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<opaque>)")
    }
}

/// Pluggable one-way comparison primitive.
///
/// `verify` answers match / no-match only and must not fail on hostile input.
pub trait CredentialScheme: Send + Sync {
    fn derive(&self, secret: &Secret) -> Result<Credential, AuthError>;
    fn verify(&self, secret: &Secret, credential: &Credential) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Salted Argon2id credentials encoded as PHC strings.
#[derive(Clone, Debug)]
pub struct Argon2Scheme {
    params: Params,
}

impl Argon2Scheme {
    pub fn new(kdf: KdfParams) -> Result<Self, AuthError> {
        let params = ParamsBuilder::new()
            .m_cost(kdf.memory_kib)
            .t_cost(kdf.iterations)
            .p_cost(kdf.parallelism)
            .build()
            .map_err(|err| AuthError::Params(err.to_string()))?;
        Ok(Self { params })
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl Default for Argon2Scheme {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl CredentialScheme for Argon2Scheme {
    fn derive(&self, secret: &Secret) -> Result<Credential, AuthError> {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let salt = SaltString::encode_b64(&salt).map_err(|err| AuthError::Derive(err.to_string()))?;
        let hash = self
            .hasher()
            .hash_password(&secret.material(), &salt)
            .map_err(|err| AuthError::Derive(err.to_string()))?;
        Ok(Credential(hash.to_string()))
    }

    fn verify(&self, secret: &Secret, credential: &Credential) -> bool {
        let Ok(parsed) = PasswordHash::new(credential.as_str()) else {
            return false;
        };
        let Ok(params) = Params::try_from(&parsed) else {
            return false;
        };
        if params.m_cost() > MAX_VERIFY_MEMORY_KIB || params.t_cost() > MAX_VERIFY_ITERATIONS {
            tracing::debug!(
                target: "argus::auth",
                memory_kib = params.m_cost(),
                iterations = params.t_cost(),
                "credential kdf cost above limit"
            );
            return false;
        }
        Argon2::default()
            .verify_password(&secret.material(), &parsed)
            .is_ok()
    }
}
