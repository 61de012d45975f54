//! Credential capabilities consulted during the handshake.
//!
//! The client never reads credential files or performs cryptography
//! itself: an [`Authenticator`] is handed the server nonce and answers
//! with the handshake fields to merge into `CONNECT`. Credentials are
//! furnished as thunks so they can rotate between reconnects.

use std::fmt;
use std::sync::Arc;

use error::NatsError;
use protocol::commands::ConnectCommand;

/// A credential source, re-read at every handshake.
pub type CredentialSource = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// A signing capability: given the raw server nonce, returns the
/// base64url-encoded signature to place in the `sig` field.
pub type NonceSigner = Arc<dyn Fn(&[u8]) -> Result<String, NatsError> + Send + Sync>;

/// The handshake fields an authenticator contributes to `CONNECT`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthFields {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub auth_token: Option<String>,
    pub jwt: Option<String>,
    pub nkey: Option<String>,
    pub sig: Option<String>,
}

impl AuthFields {
    pub(crate) fn apply(self, connect: &mut ConnectCommand) {
        connect.user = self.user.or(connect.user.take());
        connect.pass = self.pass.or(connect.pass.take());
        connect.auth_token = self.auth_token.or(connect.auth_token.take());
        connect.jwt = self.jwt.or(connect.jwt.take());
        connect.nkey = self.nkey.or(connect.nkey.take());
        connect.sig = self.sig.or(connect.sig.take());
    }
}

/// Contributes credential fields to the handshake, possibly by signing
/// the server-issued nonce.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, nonce: &str) -> Result<AuthFields, NatsError>;
}

impl<F> Authenticator for F
where
    F: Fn(&str) -> Result<AuthFields, NatsError> + Send + Sync,
{
    fn authenticate(&self, nonce: &str) -> Result<AuthFields, NatsError> {
        self(nonce)
    }
}

/// Username/password authentication.
pub struct UserPassAuthenticator {
    user: String,
    pass: CredentialSource,
}

impl UserPassAuthenticator {
    pub fn new<U: Into<String>, P: Into<Vec<u8>>>(user: U, pass: P) -> Self {
        let pass = pass.into();
        UserPassAuthenticator {
            user: user.into(),
            pass: Arc::new(move || pass.clone()),
        }
    }

    pub fn with_source<U: Into<String>>(user: U, pass: CredentialSource) -> Self {
        UserPassAuthenticator {
            user: user.into(),
            pass,
        }
    }
}

impl Authenticator for UserPassAuthenticator {
    fn authenticate(&self, _nonce: &str) -> Result<AuthFields, NatsError> {
        Ok(AuthFields {
            user: Some(self.user.clone()),
            pass: Some(String::from_utf8_lossy(&(self.pass)()).into_owned()),
            ..AuthFields::default()
        })
    }
}

impl fmt::Debug for UserPassAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UserPassAuthenticator")
            .field("user", &self.user)
            .finish()
    }
}

/// Token authentication.
pub struct TokenAuthenticator {
    token: CredentialSource,
}

impl TokenAuthenticator {
    pub fn new<T: Into<Vec<u8>>>(token: T) -> Self {
        let token = token.into();
        TokenAuthenticator {
            token: Arc::new(move || token.clone()),
        }
    }

    pub fn with_source(token: CredentialSource) -> Self {
        TokenAuthenticator { token }
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, _nonce: &str) -> Result<AuthFields, NatsError> {
        Ok(AuthFields {
            auth_token: Some(String::from_utf8_lossy(&(self.token)()).into_owned()),
            ..AuthFields::default()
        })
    }
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenAuthenticator").finish()
    }
}

/// Key-based authentication: presents a public key (and optionally a JWT)
/// and proves possession by signing the server nonce through the
/// caller-provided signer.
pub struct KeyAuthenticator {
    nkey: String,
    jwt: Option<CredentialSource>,
    signer: NonceSigner,
}

impl KeyAuthenticator {
    pub fn new<K: Into<String>>(nkey: K, signer: NonceSigner) -> Self {
        KeyAuthenticator {
            nkey: nkey.into(),
            jwt: None,
            signer,
        }
    }

    pub fn with_jwt<K: Into<String>>(nkey: K, jwt: CredentialSource, signer: NonceSigner) -> Self {
        KeyAuthenticator {
            nkey: nkey.into(),
            jwt: Some(jwt),
            signer,
        }
    }
}

impl Authenticator for KeyAuthenticator {
    fn authenticate(&self, nonce: &str) -> Result<AuthFields, NatsError> {
        let sig = if nonce.is_empty() {
            None
        } else {
            Some((self.signer)(nonce.as_bytes())?)
        };

        Ok(AuthFields {
            nkey: Some(self.nkey.clone()),
            jwt: self
                .jwt
                .as_ref()
                .map(|jwt| String::from_utf8_lossy(&jwt()).into_owned()),
            sig,
            ..AuthFields::default()
        })
    }
}

impl fmt::Debug for KeyAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyAuthenticator")
            .field("nkey", &self.nkey)
            .field("jwt_exists", &self.jwt.is_some())
            .finish()
    }
}
