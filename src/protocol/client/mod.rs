mod connect;
pub use self::connect::*;

mod pub_cmd;
pub use self::pub_cmd::*;

mod sub_cmd;
pub use self::sub_cmd::*;

mod unsub_cmd;
pub use self::unsub_cmd::*;
