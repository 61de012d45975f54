use bytes::{BufMut, Bytes, BytesMut};
use protocol::headers::{HeaderMap, InlineStatus};
use protocol::{check_subject, Command, CommandError, Op};

/// A message delivered to a subscriber, parsed from `MSG` or `HMSG`.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct Message {
    #[builder(setter(into))]
    pub subject: String,
    pub sid: u64,
    #[builder(default)]
    pub reply_to: Option<String>,
    #[builder(default)]
    pub headers: Option<HeaderMap>,
    #[builder(default)]
    pub status: Option<InlineStatus>,
    #[builder(setter(into), default)]
    pub payload: Bytes,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    fn has_header_block(&self) -> bool {
        self.headers.is_some() || self.status.is_some()
    }
}

impl Command for Message {
    const CMD_NAME: &'static [u8] = b"MSG";

    fn into_vec(self) -> Result<Bytes, CommandError> {
        let rt = if let Some(ref reply_to) = self.reply_to {
            format!(" {}", reply_to)
        } else {
            "".into()
        };

        let mut bytes = BytesMut::new();
        if self.has_header_block() {
            let block = self
                .headers
                .as_ref()
                .cloned()
                .unwrap_or_default()
                .encode_block(self.status.as_ref());

            let cmd_str = format!(
                "HMSG {} {}{} {} {}\r\n",
                self.subject,
                self.sid,
                rt,
                block.len(),
                block.len() + self.payload.len()
            );
            bytes.reserve(cmd_str.len() + block.len());
            bytes.put(cmd_str.as_bytes());
            bytes.put(block);
        } else {
            let cmd_str = format!(
                "MSG {} {}{} {}\r\n",
                self.subject,
                self.sid,
                rt,
                self.payload.len()
            );
            bytes.reserve(cmd_str.len());
            bytes.put(cmd_str.as_bytes());
        }

        bytes.reserve(self.payload.len() + 2);
        bytes.put(self.payload);
        bytes.put("\r\n");

        Ok(bytes.freeze())
    }

    fn try_parse(buf: &[u8]) -> Result<Self, CommandError> {
        match Op::try_parse_frame(buf)? {
            Op::MSG(msg) => Ok(msg),
            _ => Err(CommandError::CommandMalformed),
        }
    }
}

impl MessageBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(ref subj) = self.subject {
            check_subject(subj).map_err(|e| e.to_string())?;
        }

        if let Some(&Some(ref reply_to)) = self.reply_to.as_ref() {
            check_subject(reply_to).map_err(|e| e.to_string())?;
        }

        Ok(())
    }
}
