use bytes::Bytes;
use protocol::{check_subscribe_subject, Command, CommandError, Op};

/// A `SUB` command. The `sid` is allocated by the subscription registry
/// when left at its default.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct SubCommand {
    pub subject: String,
    #[builder(default)]
    pub queue_group: Option<String>,
    #[builder(default)]
    pub sid: u64,
}

impl SubCommand {
    pub fn builder() -> SubCommandBuilder {
        SubCommandBuilder::default()
    }
}

impl Command for SubCommand {
    const CMD_NAME: &'static [u8] = b"SUB";

    fn into_vec(self) -> Result<Bytes, CommandError> {
        let qg = if let Some(ref queue_group) = self.queue_group {
            format!(" {}", queue_group)
        } else {
            "".into()
        };

        Ok(format!("SUB {}{} {}\r\n", self.subject, qg, self.sid)
            .as_bytes()
            .into())
    }

    fn try_parse(buf: &[u8]) -> Result<Self, CommandError> {
        match Op::try_parse_frame(buf)? {
            Op::SUB(cmd) => Ok(cmd),
            _ => Err(CommandError::CommandMalformed),
        }
    }
}

impl SubCommandBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(ref subj) = self.subject {
            check_subscribe_subject(subj).map_err(|e| e.to_string())?;
        }

        if let Some(&Some(ref qg)) = self.queue_group.as_ref() {
            if qg.is_empty() || qg.contains(' ') || qg.contains('\t') {
                return Err(format!("queue group `{}` is invalid", qg));
            }
        }

        Ok(())
    }
}
