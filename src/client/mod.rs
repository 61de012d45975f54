use futures::stream;
use net::NatsConnection;

/// Sink (write) part of the framed connection
type NatsSink = stream::SplitSink<NatsConnection>;
/// Stream (read) part of the framed connection
type NatsStream = stream::SplitStream<NatsConnection>;

mod sender;
mod registry;
mod mux;
mod status;
mod client;

pub use self::client::*;
pub use self::registry::SubscriptionStream;
pub use self::status::{StatusEvent, StatusStream};
