use serde_json as json;

#[derive(Debug, Fail)]
pub enum CommandError {
    #[fail(display = "JSONError: {}", _0)]
    JsonError(json::Error),
    #[fail(display = "BadSubject: {}", _0)]
    BadSubject(String),
    #[fail(display = "BadHeader: {}", _0)]
    BadHeader(String),
    #[fail(display = "Command is incomplete, cannot parse")]
    IncompleteCommandError,
    #[fail(display = "Command doesn't exist or is not supported")]
    CommandNotFoundOrSupported,
    #[fail(display = "Command is malformed")]
    CommandMalformed,
    #[fail(display = "UTF8Error: {}", _0)]
    UTF8SliceError(::std::str::Utf8Error),
    #[fail(display = "UTF8Error: {}", _0)]
    UTF8StringError(::std::string::FromUtf8Error),
    #[fail(display = "PayloadLengthParseError: {}", _0)]
    PayloadLengthParseError(::std::num::ParseIntError),
    #[fail(display = "GenericError: {}", _0)]
    GenericError(String),
}

macro_rules! from_command_error {
    ($type:ty, $targetvar:expr) => {
        impl From<$type> for CommandError {
            fn from(s: $type) -> Self {
                $targetvar(s.into())
            }
        }
    };
}

from_command_error!(json::Error, CommandError::JsonError);
from_command_error!(::std::str::Utf8Error, CommandError::UTF8SliceError);
from_command_error!(::std::string::FromUtf8Error, CommandError::UTF8StringError);
from_command_error!(::std::num::ParseIntError, CommandError::PayloadLengthParseError);
from_command_error!(String, CommandError::GenericError);
