pub(crate) mod connection;
mod tls;

pub(crate) use self::connection::NatsConnection;
pub use self::tls::NatsClientTlsConfig;
