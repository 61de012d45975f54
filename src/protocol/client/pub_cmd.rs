use bytes::{BufMut, Bytes, BytesMut};
use protocol::headers::HeaderMap;
use protocol::{check_subject, Command, CommandError, Op};

/// A `PUB` — or `HPUB`, when headers ride along — command.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct PubCommand {
    pub subject: String,
    #[builder(default)]
    pub reply_to: Option<String>,
    #[builder(default)]
    pub headers: Option<HeaderMap>,
    #[builder(setter(into), default)]
    pub payload: Bytes,
}

impl PubCommand {
    pub fn builder() -> PubCommandBuilder {
        PubCommandBuilder::default()
    }

    /// Generates a unique reply inbox subject.
    pub fn generate_reply_to() -> String {
        format!("_INBOX.{}", ::nuid::next())
    }
}

impl Command for PubCommand {
    const CMD_NAME: &'static [u8] = b"PUB";

    fn into_vec(self) -> Result<Bytes, CommandError> {
        let rt = if let Some(ref reply_to) = self.reply_to {
            format!(" {}", reply_to)
        } else {
            "".into()
        };

        let mut bytes = BytesMut::new();
        match self.headers {
            Some(ref headers) => {
                let block = headers.encode();
                let cmd_str = format!(
                    "HPUB {}{} {} {}\r\n",
                    self.subject,
                    rt,
                    block.len(),
                    block.len() + self.payload.len()
                );
                bytes.reserve(cmd_str.len() + block.len());
                bytes.put(cmd_str.as_bytes());
                bytes.put(block);
            }
            None => {
                let cmd_str = format!("PUB {}{} {}\r\n", self.subject, rt, self.payload.len());
                bytes.reserve(cmd_str.len());
                bytes.put(cmd_str.as_bytes());
            }
        }

        bytes.reserve(self.payload.len() + 2);
        bytes.put(self.payload);
        bytes.put("\r\n");

        Ok(bytes.freeze())
    }

    fn try_parse(buf: &[u8]) -> Result<Self, CommandError> {
        match Op::try_parse_frame(buf)? {
            Op::PUB(cmd) => Ok(cmd),
            _ => Err(CommandError::CommandMalformed),
        }
    }
}

impl PubCommandBuilder {
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
