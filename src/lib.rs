//! natrix is a `tokio`-based client for the NATS messaging protocol:
//! publish/subscribe, queue groups, request/reply over a multiplexed
//! inbox, `HPUB`/`HMSG` headers, and automatic reconnection with
//! subscription replay across a gossiped server pool.

#[macro_use]
extern crate derive_builder;

extern crate failure;
#[macro_use]
extern crate failure_derive;

extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;

extern crate bytes;
extern crate rand;

#[allow(unused_imports)]
#[macro_use]
extern crate log;

#[cfg(test)]
extern crate tokio;

extern crate futures;
extern crate native_tls;
extern crate parking_lot;
extern crate tokio_codec;
extern crate tokio_executor;
extern crate tokio_tcp;
extern crate tokio_timer;
extern crate tokio_tls;
extern crate url;

#[macro_use]
mod error;
pub use self::error::*;

pub mod auth;
pub mod codec;
pub mod nuid;
pub mod pool;
pub mod protocol;

pub use self::protocol::commands;
pub use self::protocol::Op;

pub mod net;

mod client;
pub use self::client::*;
