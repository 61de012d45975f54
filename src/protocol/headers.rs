//! The MIME-style header block carried by `HPUB`/`HMSG` frames.

use bytes::Bytes;
use std::slice;

use super::CommandError;

pub const HEADER_VERSION: &str = "NATS/1.0";

/// Status line a server may inline before the headers of a generated
/// reply, e.g. `NATS/1.0 503 No Responders`.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineStatus {
    pub code: u16,
    pub description: Option<String>,
}

/// An ordered multimap of canonicalized header keys to values.
///
/// Keys are canonicalized to ASCII title-case per hyphen segment, so
/// `content-type` and `Content-Type` address the same entry. Insertion
/// order is preserved on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap::default()
    }

    /// Replaces every value under `key` with `value`.
    pub fn insert<K: AsRef<str>, V: Into<String>>(&mut self, key: K, value: V) -> Result<(), CommandError> {
        let key = canonicalize_key(key.as_ref())?;
        let value = check_value(value.into())?;
        self.entries.retain(|&(ref k, _)| *k != key);
        self.entries.push((key, value));
        Ok(())
    }

    /// Adds `value` under `key`, keeping any existing values.
    pub fn append<K: AsRef<str>, V: Into<String>>(&mut self, key: K, value: V) -> Result<(), CommandError> {
        let key = canonicalize_key(key.as_ref())?;
        let value = check_value(value.into())?;
        self.entries.push((key, value));
        Ok(())
    }

    /// First value under `key`, if any.
    pub fn get<K: AsRef<str>>(&self, key: K) -> Option<&str> {
        let key = canonicalize_key(key.as_ref()).ok()?;
        self.entries
            .iter()
            .find(|&&(ref k, _)| *k == key)
            .map(|&(_, ref v)| v.as_str())
    }

    /// Every value under `key`, in insertion order.
    pub fn get_all<K: AsRef<str>>(&self, key: K) -> Vec<&str> {
        match canonicalize_key(key.as_ref()) {
            Ok(key) => self
                .entries
                .iter()
                .filter(|&&(ref k, _)| *k == key)
                .map(|&(_, ref v)| v.as_str())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<(String, String)> {
        self.entries.iter()
    }

    /// Wire size of [`encode`](HeaderMap::encode) without building it.
    pub fn encoded_len(&self) -> usize {
        self.block_len(None)
    }

    pub(crate) fn block_len(&self, status: Option<&InlineStatus>) -> usize {
        let status_len = match status {
            Some(&InlineStatus {
                code,
                ref description,
            }) => {
                // " <code>" plus an optional " <description>"
                1 + code.to_string().len()
                    + description.as_ref().map(|d| d.len() + 1).unwrap_or(0)
            }
            None => 0,
        };

        HEADER_VERSION.len()
            + status_len
            + 2
            + self
                .entries
                .iter()
                .map(|&(ref k, ref v)| k.len() + 2 + v.len() + 2)
                .sum::<usize>()
            + 2
    }

    /// Encodes the block: version preamble, `Key: Value` lines, blank line.
    pub fn encode(&self) -> Bytes {
        self.encode_block(None)
    }

    pub(crate) fn encode_block(&self, status: Option<&InlineStatus>) -> Bytes {
        let mut out = String::with_capacity(self.block_len(status));
        out.push_str(HEADER_VERSION);
        if let Some(status) = status {
            out.push(' ');
            out.push_str(&status.code.to_string());
            if let Some(ref description) = status.description {
                out.push(' ');
                out.push_str(description);
            }
        }
        out.push_str("\r\n");
        for &(ref key, ref value) in &self.entries {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");

        out.into()
    }

    /// Decodes a complete header block, yielding the map and the inline
    /// status when the server put one on the preamble line.
    pub fn decode(buf: &[u8]) -> Result<(HeaderMap, Option<InlineStatus>), CommandError> {
        let text = ::std::str::from_utf8(buf)?;
        let mut lines = text.split("\r\n");

        let preamble = lines.next().ok_or(CommandError::CommandMalformed)?;
        if !preamble.starts_with(HEADER_VERSION) {
            return Err(CommandError::BadHeader(format!(
                "header block does not start with `{}`",
                HEADER_VERSION
            )));
        }

        let status = parse_inline_status(preamble[HEADER_VERSION.len()..].trim());

        let mut map = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon = line.find(':').ok_or_else(|| {
                CommandError::BadHeader(format!("header line `{}` has no separator", line))
            })?;
            let (key, rest) = line.split_at(colon);
            map.append(key, rest[1..].trim())?;
        }

        Ok((map, status))
    }
}

fn parse_inline_status(rest: &str) -> Option<InlineStatus> {
    if rest.is_empty() {
        return None;
    }

    let mut parts = rest.splitn(2, ' ');
    let code = parts.next()?.parse().ok()?;
    let description = parts.next().map(|d| d.trim().to_string()).filter(|d| !d.is_empty());

    Some(InlineStatus { code, description })
}

fn canonicalize_key(key: &str) -> Result<String, CommandError> {
    if key.is_empty() {
        return Err(CommandError::BadHeader("header key is empty".into()));
    }

    if key
        .bytes()
        .any(|b| b == b':' || b <= b' ' || b >= 0x7f)
    {
        return Err(CommandError::BadHeader(format!(
            "header key `{}` contains `:`, whitespace or control bytes",
            key
        )));
    }

    let mut out = String::with_capacity(key.len());
    let mut upper = true;
    for c in key.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }

    Ok(out)
}

fn check_value(value: String) -> Result<String, CommandError> {
    if value.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(CommandError::BadHeader(
            "header value contains CR or LF".into(),
        ));
    }

    Ok(value)
}
