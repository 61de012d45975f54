macro_rules! from_error {
    ($type:ty, $target:ident, $targetvar:expr) => {
        impl From<$type> for $target {
            fn from(s: $type) -> Self {
                $targetvar(s.to_string())
            }
        }
    };
}

use protocol::server::ServerError;
use protocol::CommandError;

/// Every failure the client can surface. The enum is `Clone` so a single
/// error can flow through the shared `closed()` future and the status bus
/// at the same time; non-clonable causes (IO, TLS, JSON) are stringified.
#[derive(Debug, Clone, PartialEq, Fail)]
pub enum NatsError {
    #[fail(display = "BadSubject: invalid subject `{}`", _0)]
    BadSubject(String),
    #[fail(display = "BadHeader: {}", _0)]
    BadHeader(String),
    #[fail(display = "BadPayload: {}", _0)]
    BadPayload(String),
    #[fail(display = "ConnectionClosed: the connection is closed")]
    ConnectionClosed,
    #[fail(display = "ConnectionDraining: the connection is draining")]
    ConnectionDraining,
    #[fail(display = "ConnectionRefused: {}", _0)]
    ConnectionRefused(String),
    #[fail(display = "ConnectionTimeout: the operation did not complete in time")]
    ConnectionTimeout,
    #[fail(display = "ServerOptionNA: the server does not support `{}`", _0)]
    ServerOptionNA(String),
    #[fail(display = "AuthorizationViolation: the server rejected our credentials")]
    AuthorizationViolation,
    #[fail(display = "PermissionsViolation: {}", _0)]
    PermissionsViolation(String),
    #[fail(display = "StaleConnection: the server stopped answering pings")]
    StaleConnection,
    #[fail(display = "SlowConsumer: the consumer cannot keep up")]
    SlowConsumer,
    #[fail(display = "Timeout: the deadline elapsed")]
    Timeout,
    #[fail(display = "MaxPayloadExceeded: the server accepts at most {} bytes", _0)]
    MaxPayloadExceeded(u32),
    #[fail(display = "ProtocolError: {}", _0)]
    ProtocolError(String),
    #[fail(display = "NoResponders: nobody is listening on that subject")]
    NoResponders,
    #[fail(display = "ServerError: {}", _0)]
    ServerError(String),
    #[fail(display = "TlsError: {}", _0)]
    TlsError(String),
    #[fail(display = "TlsHostMissingError: the server URL carries no host to verify against")]
    TlsHostMissingError,
    #[fail(display = "UriDNSResolveError: {}", _0)]
    UriDNSResolveError(String),
    #[fail(display = "InvalidServerUrl: {}", _0)]
    InvalidServerUrl(String),
    #[fail(display = "IOError: {}", _0)]
    IOError(String),
    #[fail(display = "InnerBrokenChain: the inner command chain broke, please file a bug")]
    InnerBrokenChain,
    #[fail(display = "{}", _0)]
    GenericError(String),
}

impl NatsError {
    /// Server errors that terminate the connection instead of triggering a
    /// reconnect.
    pub fn is_fatal(&self) -> bool {
        match *self {
            NatsError::AuthorizationViolation
            | NatsError::PermissionsViolation(_)
            | NatsError::StaleConnection
            | NatsError::SlowConsumer => true,
            _ => false,
        }
    }
}

from_error!(::std::io::Error, NatsError, NatsError::IOError);
from_error!(::native_tls::Error, NatsError, NatsError::TlsError);
from_error!(::url::ParseError, NatsError, NatsError::InvalidServerUrl);

impl From<String> for NatsError {
    fn from(s: String) -> Self {
        NatsError::GenericError(s)
    }
}

impl From<CommandError> for NatsError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::BadSubject(s) => NatsError::BadSubject(s),
            CommandError::BadHeader(s) => NatsError::BadHeader(s),
            e => NatsError::ProtocolError(e.to_string()),
        }
    }
}

impl From<ServerError> for NatsError {
    fn from(e: ServerError) -> Self {
        let lowered = e.reason().to_lowercase();
        if lowered.contains("authorization violation") {
            NatsError::AuthorizationViolation
        } else if lowered.contains("permissions violation") {
            NatsError::PermissionsViolation(e.reason().to_owned())
        } else if lowered.contains("stale connection") {
            NatsError::StaleConnection
        } else if lowered.contains("slow consumer") {
            NatsError::SlowConsumer
        } else {
            NatsError::ServerError(e.reason().to_owned())
        }
    }
}
