mod info;
pub use self::info::*;

mod message;
pub use self::message::*;

mod server_error;
pub use self::server_error::*;
