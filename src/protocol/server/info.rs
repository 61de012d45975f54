use bytes::Bytes;
use protocol::{Command, CommandError, Op};
use serde_json as json;

/// The JSON descriptor the server sends on connect and on cluster changes.
/// Every field defaults so INFO payloads from any server generation parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(setter(into), default)]
pub struct ServerInfo {
    /// The unique identifier of the NATS server
    #[serde(default)]
    pub server_id: String,
    /// The version of the NATS server
    #[serde(default)]
    pub version: String,
    /// The version of golang the NATS server was built with
    #[serde(default)]
    pub go: String,
    /// The address the server advertises for clients
    #[serde(default)]
    pub host: String,
    /// The port number the NATS server is configured to listen on
    #[serde(default)]
    pub port: u32,
    /// An integer indicating the protocol version of the server
    #[serde(default)]
    #[builder(default = "1")]
    pub proto: u8,
    /// Maximum payload size, in bytes, that the server will accept from the client
    #[serde(default = "default_max_payload")]
    #[builder(default = "default_max_payload()")]
    pub max_payload: u32,
    /// The internal client identifier in the server, useful to correlate monitoring
    /// and error logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    /// If this is set, then the client should try to authenticate upon connect
    #[serde(default)]
    pub auth_required: bool,
    /// If this is set, then the client must perform the TLS/1.2 handshake
    #[serde(default)]
    pub tls_required: bool,
    /// If this is set, the client must provide a valid certificate during the TLS handshake
    #[serde(default)]
    pub tls_verify: bool,
    /// An optional list of server urls that a client can connect to, gossiped as the
    /// cluster topology changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_urls: Option<Vec<String>>,
    /// The nonce the client must sign when key-based authentication is in use
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nonce: String,
    /// Whether the server understands the `HPUB`/`HMSG` header protocol
    #[serde(default)]
    pub headers: bool,
    /// Whether the server entered lame-duck mode and will evict clients soon
    #[serde(default)]
    pub ldm: bool,
}

fn default_max_payload() -> u32 {
    1_048_576
}

impl Default for ServerInfo {
    fn default() -> Self {
        ServerInfo {
            server_id: String::new(),
            version: String::new(),
            go: String::new(),
            host: String::new(),
            port: 0,
            proto: 1,
            max_payload: default_max_payload(),
            client_id: None,
            auth_required: false,
            tls_required: false,
            tls_verify: false,
            connect_urls: None,
            nonce: String::new(),
            headers: false,
            ldm: false,
        }
    }
}

impl ServerInfo {
    pub fn builder() -> ServerInfoBuilder {
        ServerInfoBuilder::default()
    }
}

impl Command for ServerInfo {
    const CMD_NAME: &'static [u8] = b"INFO";

    fn into_vec(self) -> Result<Bytes, CommandError> {
        Ok(format!("INFO {}\r\n", json::to_string(&self)?).as_bytes().into())
    }

    fn try_parse(buf: &[u8]) -> Result<Self, CommandError> {
        match Op::try_parse_frame(buf)? {
            Op::INFO(info) => Ok(info),
            _ => Err(CommandError::CommandMalformed),
        }
    }
}

#[cfg(test)]
mod info_command_tests {
    use super::*;
    use protocol::Command;

    static DEFAULT_INFO: &'static str = "INFO {\"server_id\":\"test\",\"version\":\"2.9.0\",\"go\":\"go1.19.1\",\"host\":\"0.0.0.0\",\"port\":4222,\"max_payload\":4000,\"proto\":1,\"client_id\":1337,\"headers\":true}\r\n";

    #[test]
    fn it_parses() {
        let parse_res = ServerInfo::try_parse(DEFAULT_INFO.as_bytes());
        assert!(parse_res.is_ok());
        let info = parse_res.unwrap();
        assert_eq!(&info.server_id, "test");
        assert_eq!(info.max_payload, 4000);
        assert!(info.headers);
        assert!(!info.ldm);
        assert!(info.nonce.is_empty());
    }

    #[test]
    fn it_defaults_missing_fields() {
        let info = ServerInfo::try_parse(b"INFO {\"server_id\":\"min\"}\r\n").unwrap();
        assert_eq!(info.max_payload, 1_048_576);
        assert!(!info.auth_required);
        assert!(info.connect_urls.is_none());
    }

    #[test]
    fn it_stringifies() {
        let info = ServerInfo::builder()
            .server_id("test")
            .host("127.0.0.1")
            .port(4222u32)
            .build()
            .unwrap();

        let bytes = info.clone().into_vec().unwrap();
        let reparsed = ServerInfo::try_parse(&bytes).unwrap();
        assert_eq!(reparsed, info);
    }
}
