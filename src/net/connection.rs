use std::net::SocketAddr;
use std::time::Duration;

use futures::future::{self, Either};
use futures::prelude::*;
use tokio_codec::{Decoder, Framed, FramedParts};
use tokio_tcp::TcpStream;
use tokio_timer::Timeout;
use tokio_tls::{TlsConnector, TlsStream};

use codec::OpCodec;
use error::NatsError;
use protocol::Op;

use super::tls::NatsClientTlsConfig;

/// A framed duplex to one server, over raw TCP or TLS.
#[derive(Debug)]
pub enum NatsConnection {
    /// Raw TCP Stream framed connection
    Tcp(Box<Framed<TcpStream, OpCodec>>),
    /// TLS over TCP Stream framed connection
    Tls(Box<Framed<TlsStream<TcpStream>, OpCodec>>),
}

impl NatsConnection {
    /// Opens a framed TCP connection, bounded by `deadline`.
    pub(crate) fn connect(
        addr: SocketAddr,
        deadline: Duration,
    ) -> impl Future<Item = NatsConnection, Error = NatsError> {
        debug!(target: "natrix", "Connecting to {} through TCP", addr);
        Timeout::new(TcpStream::connect(&addr), deadline).then(|res| match res {
            Ok(socket) => Ok(NatsConnection::from(socket)),
            Err(e) => {
                if e.is_elapsed() {
                    Err(NatsError::ConnectionTimeout)
                } else {
                    match e.into_inner() {
                        Some(io) => Err(NatsError::ConnectionRefused(io.to_string())),
                        None => Err(NatsError::ConnectionTimeout),
                    }
                }
            }
        })
    }

    /// Upgrades a plaintext connection to TLS, after the server's `INFO`
    /// has been read. Whatever the read buffer already holds survives the
    /// upgrade.
    pub(crate) fn upgrade_to_tls(
        self,
        host: String,
        config: &NatsClientTlsConfig,
    ) -> impl Future<Item = NatsConnection, Error = NatsError> {
        let connector = config.build_connector();
        future::result(connector).and_then(move |connector| match self {
            NatsConnection::Tcp(framed) => {
                debug!(target: "natrix", "Upgrading connection to {} to TLS", host);
                let parts = framed.into_parts();
                let read_buf = parts.read_buf;
                let codec = parts.codec;
                let connector: TlsConnector = connector.into();

                Either::A(connector.connect(&host, parts.io).from_err().map(
                    move |tls_stream| {
                        let mut new_parts = FramedParts::new(tls_stream, codec);
                        new_parts.read_buf = read_buf;
                        NatsConnection::Tls(Box::new(Framed::from_parts(new_parts)))
                    },
                ))
            }
            conn @ NatsConnection::Tls(_) => Either::B(future::ok(conn)),
        })
    }

    pub(crate) fn is_tls(&self) -> bool {
        match *self {
            NatsConnection::Tls(_) => true,
            NatsConnection::Tcp(_) => false,
        }
    }
}

impl From<TcpStream> for NatsConnection {
    fn from(socket: TcpStream) -> Self {
        NatsConnection::Tcp(Box::new(OpCodec::default().framed(socket)))
    }
}

impl From<TlsStream<TcpStream>> for NatsConnection {
    fn from(socket: TlsStream<TcpStream>) -> Self {
        NatsConnection::Tls(Box::new(OpCodec::default().framed(socket)))
    }
}

impl Sink for NatsConnection {
    type SinkError = NatsError;
    type SinkItem = Op;

    fn start_send(&mut self, item: Self::SinkItem) -> StartSend<Self::SinkItem, Self::SinkError> {
        match self {
            NatsConnection::Tcp(framed) => framed.start_send(item),
            NatsConnection::Tls(framed) => framed.start_send(item),
        }
    }

    fn poll_complete(&mut self) -> Poll<(), Self::SinkError> {
        match self {
            NatsConnection::Tcp(framed) => framed.poll_complete(),
            NatsConnection::Tls(framed) => framed.poll_complete(),
        }
    }
}

impl Stream for NatsConnection {
    type Error = NatsError;
    type Item = Op;

    fn poll(&mut self) -> Poll<Option<Self::Item>, Self::Error> {
        match self {
            NatsConnection::Tcp(framed) => framed.poll(),
            NatsConnection::Tls(framed) => framed.poll(),
        }
    }
}

