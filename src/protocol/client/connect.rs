use bytes::Bytes;
use protocol::{Command, CommandError, Op};
use serde_json as json;

/// The handshake command sent right after the server's `INFO`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(setter(into), default)]
pub struct ConnectCommand {
    /// Turns on +OK protocol acknowledgements.
    pub verbose: bool,
    /// Turns on additional strict format checking, e.g. for properly formed subjects
    pub pedantic: bool,
    /// Indicates whether the client requires an SSL connection.
    pub tls_required: bool,
    /// Client authorization token (if auth_required is set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Connection username (if auth_required is set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Connection password (if auth_required is set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// Optional client name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The implementation language of the client.
    #[builder(default = "\"rust\".into()")]
    pub lang: String,
    /// The version of the client.
    #[builder(default = "env!(\"CARGO_PKG_VERSION\").into()")]
    pub version: String,
    /// Sending 0 (or absent) indicates client supports original protocol. Sending 1
    /// indicates that the client supports dynamic reconfiguration of cluster topology
    /// changes by asynchronously receiving INFO messages with known servers it can
    /// reconnect to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default = "Some(1)")]
    pub protocol: Option<u8>,
    /// If set to false, the server (version 1.2.0+) will not send originating messages
    /// from this connection to its own subscriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<bool>,
    /// The user's JWT (key-based authentication).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    /// The public key the server should verify the nonce signature against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    /// The server nonce signed by the authenticator, base64url-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    /// Whether the client wants `HMSG` deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<bool>,
    /// Whether the client understands synthesized `503 No Responders` replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_responders: Option<bool>,
}

impl Default for ConnectCommand {
    fn default() -> Self {
        ConnectCommand {
            verbose: false,
            pedantic: false,
            tls_required: false,
            auth_token: None,
            user: None,
            pass: None,
            name: None,
            lang: "rust".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            protocol: Some(1),
            echo: None,
            jwt: None,
            nkey: None,
            sig: None,
            headers: None,
            no_responders: None,
        }
    }
}

impl ConnectCommand {
    pub fn builder() -> ConnectCommandBuilder {
        ConnectCommandBuilder::default()
    }
}

impl Command for ConnectCommand {
    const CMD_NAME: &'static [u8] = b"CONNECT";

    fn into_vec(self) -> Result<Bytes, CommandError> {
        Ok(format!("CONNECT {}\r\n", json::to_string(&self)?).as_bytes().into())
    }

    fn try_parse(buf: &[u8]) -> Result<Self, CommandError> {
        match Op::try_parse_frame(buf)? {
            Op::CONNECT(cmd) => Ok(cmd),
            _ => Err(CommandError::CommandMalformed),
        }
    }
}

#[cfg(test)]
mod connect_command_tests {
    use super::*;
    use protocol::Command;

    #[test]
    fn it_parses() {
        let cmd = b"CONNECT {\"verbose\":false,\"pedantic\":false,\"tls_required\":false,\"name\":\"natrix\",\"lang\":\"rust\",\"version\":\"1.0.0\",\"headers\":true}\r\n";
        let parsed = ConnectCommand::try_parse(cmd).unwrap();
        assert_eq!(parsed.name.as_ref().unwrap(), "natrix");
        assert_eq!(parsed.headers, Some(true));
        assert!(parsed.user.is_none());
    }

    #[test]
    fn it_stringifies() {
        let cmd = ConnectCommand::builder()
            .user(Some("derek".to_string()))
            .pass(Some("s3cr3t".to_string()))
            .build()
            .unwrap();

        let bytes = cmd.clone().into_vec().unwrap();
        assert!(bytes.starts_with(b"CONNECT {"));
        assert!(bytes.ends_with(b"\r\n"));

        let reparsed = ConnectCommand::try_parse(&bytes).unwrap();
        assert_eq!(reparsed, cmd);
    }
}
