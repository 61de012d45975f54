use bytes::Bytes;
use protocol::{Command, CommandError, Op};

/// An `UNSUB` command; with `max_msgs` set the server keeps delivering
/// until that many messages went out, then forgets the sid.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into))]
pub struct UnsubCommand {
    pub sid: u64,
    #[builder(default)]
    pub max_msgs: Option<u64>,
}

impl UnsubCommand {
    pub fn builder() -> UnsubCommandBuilder {
        UnsubCommandBuilder::default()
    }
}

impl Command for UnsubCommand {
    const CMD_NAME: &'static [u8] = b"UNSUB";

    fn into_vec(self) -> Result<Bytes, CommandError> {
        let mm = if let Some(max_msgs) = self.max_msgs {
            format!(" {}", max_msgs)
        } else {
            "".into()
        };

        Ok(format!("UNSUB {}{}\r\n", self.sid, mm).as_bytes().into())
    }

    fn try_parse(buf: &[u8]) -> Result<Self, CommandError> {
        match Op::try_parse_frame(buf)? {
            Op::UNSUB(cmd) => Ok(cmd),
            _ => Err(CommandError::CommandMalformed),
        }
    }
}
