use bytes::Bytes;

/// A protocol frame that knows how to write itself to the wire and how to
/// rebuild itself from a complete buffered frame.
pub trait Command: Sized {
    const CMD_NAME: &'static [u8];

    fn into_vec(self) -> Result<Bytes, CommandError>;
    fn try_parse(buf: &[u8]) -> Result<Self, CommandError>;
}

/// Validates a publish subject: dot-delimited tokens, no whitespace or
/// control bytes, no wildcards.
pub fn check_subject(subject: &str) -> Result<(), CommandError> {
    check_tokens(subject)?;
    if subject.split('.').any(|token| token == "*" || token == ">") {
        return Err(CommandError::BadSubject(format!(
            "`{}` uses wildcards, which are reserved for subscriptions",
            subject
        )));
    }

    Ok(())
}

/// Validates a subscription subject: same as [`check_subject`], except `*`
/// tokens are allowed anywhere and a `>` token may close the subject.
pub fn check_subscribe_subject(subject: &str) -> Result<(), CommandError> {
    check_tokens(subject)?;
    let tokens: Vec<&str> = subject.split('.').collect();
    for (idx, token) in tokens.iter().enumerate() {
        if *token == ">" && idx != tokens.len() - 1 {
            return Err(CommandError::BadSubject(format!(
                "`{}` uses `>` before the final token",
                subject
            )));
        }
    }

    Ok(())
}

fn check_tokens(subject: &str) -> Result<(), CommandError> {
    if subject.is_empty() {
        return Err(CommandError::BadSubject("subject is empty".into()));
    }

    if subject.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(CommandError::BadSubject(format!(
            "`{}` contains whitespace or control bytes",
            subject
        )));
    }

    if subject.split('.').any(str::is_empty) {
        return Err(CommandError::BadSubject(format!(
            "`{}` contains an empty token",
            subject
        )));
    }

    Ok(())
}

mod error;
pub use self::error::*;

pub mod headers;

pub mod client;
pub mod op;
pub mod server;

pub use self::op::Op;

/// Flat import of every wire command, client and server side.
pub mod commands {
    pub use super::client::*;
    pub use super::server::*;
}

#[cfg(test)]
mod subject_tests {
    use super::{check_subject, check_subscribe_subject};

    #[test]
    fn it_accepts_plain_subjects() {
        assert!(check_subject("greet").is_ok());
        assert!(check_subject("time.us.east.atlanta").is_ok());
    }

    #[test]
    fn it_rejects_empty_and_whitespace() {
        assert!(check_subject("").is_err());
        assert!(check_subject("foo bar").is_err());
        assert!(check_subject("foo\tbar").is_err());
        assert!(check_subject("foo\r\n").is_err());
    }

    #[test]
    fn it_rejects_empty_tokens() {
        assert!(check_subject("foo..bar").is_err());
        assert!(check_subject(".foo").is_err());
        assert!(check_subject("foo.").is_err());
    }

    #[test]
    fn it_keeps_wildcards_out_of_publishes() {
        assert!(check_subject("a.*").is_err());
        assert!(check_subject("a.>").is_err());
        assert!(check_subscribe_subject("a.*").is_ok());
        assert!(check_subscribe_subject("a.>").is_ok());
    }

    #[test]
    fn it_only_allows_terminal_tail_wildcards() {
        assert!(check_subscribe_subject(">.a").is_err());
        assert!(check_subscribe_subject("a.>.b").is_err());
        assert!(check_subscribe_subject(">").is_ok());
    }
}
