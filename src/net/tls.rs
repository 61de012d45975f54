use std::fmt;
use std::sync::Arc;

use native_tls::{Certificate, Identity, TlsConnector as NativeTlsConnector};

use error::NatsError;

/// TLS material for the upgrade performed after the server's `INFO`: an
/// optional PKCS #12 client identity and an optional extra trusted root.
/// Both are kept as raw DER so a fresh connector can be assembled for
/// every (re)connect attempt.
#[derive(Clone, Default)]
pub struct NatsClientTlsConfig {
    identity: Option<Arc<IdentitySource>>,
    root_cert: Option<Arc<Vec<u8>>>,
}

struct IdentitySource {
    der: Vec<u8>,
    password: String,
}

impl IdentitySource {
    fn load(&self) -> Result<Identity, NatsError> {
        Identity::from_pkcs12(&self.der, &self.password).map_err(NatsError::from)
    }
}

impl NatsClientTlsConfig {
    /// Client identity from a DER-formatted PKCS #12 archive and the
    /// password that decrypts its key. The archive is validated here, so
    /// a broken one fails at configuration time instead of mid-handshake.
    pub fn pkcs12_identity<B>(mut self, der_bytes: B, password: &str) -> Result<Self, NatsError>
    where
        B: AsRef<[u8]>,
    {
        let source = IdentitySource {
            der: der_bytes.as_ref().to_vec(),
            password: password.to_owned(),
        };
        source.load()?;
        self.identity = Some(Arc::new(source));
        Ok(self)
    }

    /// Additional trusted root certificate in DER format, validated
    /// eagerly like the identity.
    pub fn root_cert_der<B>(mut self, der_bytes: B) -> Result<Self, NatsError>
    where
        B: AsRef<[u8]>,
    {
        Certificate::from_der(der_bytes.as_ref())?;
        self.root_cert = Some(Arc::new(der_bytes.as_ref().to_vec()));
        Ok(self)
    }

    /// Assembles the `native_tls` connector the post-INFO upgrade hands
    /// the socket to.
    pub(crate) fn build_connector(&self) -> Result<NativeTlsConnector, NatsError> {
        let mut builder = NativeTlsConnector::builder();
        if let Some(ref source) = self.identity {
            builder.identity(source.load()?);
        }
        if let Some(ref der) = self.root_cert {
            builder.add_root_certificate(Certificate::from_der(der)?);
        }
        builder.build().map_err(NatsError::from)
    }
}

impl fmt::Debug for NatsClientTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Never leak key material into logs.
        f.debug_struct("NatsClientTlsConfig")
            .field("has_identity", &self.identity.is_some())
            .field("has_root_cert", &self.root_cert.is_some())
            .finish()
    }
}
