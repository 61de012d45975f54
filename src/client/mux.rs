use std::collections::HashMap;

use futures::sync::oneshot;
use parking_lot::Mutex;

use error::NatsError;
use nuid;
use protocol::commands::Message;

/// Demultiplexes request replies arriving on a single wildcard inbox
/// subscription. Replies are correlated by the token that tails the
/// reply subject; every pending entry resolves at most once.
#[derive(Debug)]
pub(crate) struct RequestMultiplexer {
    prefix: String,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Message, NatsError>>>>,
}

impl RequestMultiplexer {
    pub fn new() -> Self {
        RequestMultiplexer {
            prefix: format!("_INBOX.{}", nuid::next()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The `<prefix>.*` subject the mux subscription listens on.
    pub fn wildcard_subject(&self) -> String {
        format!("{}.*", self.prefix)
    }

    /// Whether `subject` belongs to this connection's mux inbox.
    pub fn matches(&self, subject: &str) -> bool {
        subject.len() > self.prefix.len() + 1
            && subject.starts_with(&self.prefix)
            && subject.as_bytes()[self.prefix.len()] == b'.'
    }

    /// Creates a pending entry; returns its token, the reply subject to
    /// publish with, and the receiver resolved by the matching reply.
    pub fn register(
        &self,
    ) -> (
        String,
        String,
        oneshot::Receiver<Result<Message, NatsError>>,
    ) {
        let token = nuid::next();
        let reply_to = format!("{}.{}", self.prefix, token);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(token.clone(), tx);

        (token, reply_to, rx)
    }

    /// Resolves the pending entry the reply's token addresses; replies to
    /// unknown tokens (late after a timeout, or cancelled) are dropped.
    pub fn resolve(&self, msg: Message) {
        let token = match msg.subject.rfind('.') {
            Some(dot) => msg.subject[dot + 1..].to_owned(),
            None => return,
        };

        if let Some(tx) = self.pending.lock().remove(&token) {
            let _ = tx.send(reply_to_result(msg));
        } else {
            debug!(target: "natrix", "Dropping reply for unknown request token {}", token);
        }
    }

    /// Removes a pending entry without resolving it.
    pub fn cancel(&self, token: &str) {
        self.pending.lock().remove(token);
    }

    /// Drops every pending entry; their futures observe cancellation.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Maps a reply to the request outcome: a header-block status like
/// `503 No Responders` becomes the matching error.
pub(crate) fn reply_to_result(msg: Message) -> Result<Message, NatsError> {
    match msg.status {
        Some(ref status) if status.code == 503 => Err(NatsError::NoResponders),
        Some(ref status) if status.code >= 400 => Err(NatsError::ServerError(format!(
            "request failed with status {} {}",
            status.code,
            status.description.as_ref().map(String::as_str).unwrap_or("")
        ))),
        _ => Ok(msg),
    }
}

#[cfg(test)]
mod mux_tests {
    use super::*;
    use futures::prelude::*;
    use protocol::headers::InlineStatus;

    fn reply(subject: &str, body: &'static str) -> Message {
        Message::builder()
            .subject(subject)
            .sid(1u64)
            .payload(body)
            .build()
            .unwrap()
    }

    #[test]
    fn it_scopes_subjects_to_its_prefix() {
        let mux = RequestMultiplexer::new();
        let (_, reply_to, _rx) = mux.register();
        assert!(mux.matches(&reply_to));
        assert!(!mux.matches("_INBOX.someone.elses.token"));
        assert!(!mux.matches("greet"));
    }

    #[test]
    fn it_resolves_replies_by_token() {
        let mux = RequestMultiplexer::new();
        let (_, reply_to, rx) = mux.register();

        mux.resolve(reply(&reply_to, "forty-two"));
        let result = rx.wait().unwrap();
        assert_eq!(result.unwrap().payload, "forty-two");
        assert_eq!(mux.pending_count(), 0);
    }

    #[test]
    fn it_drops_unknown_tokens() {
        let mux = RequestMultiplexer::new();
        let (_, _, rx) = mux.register();

        mux.resolve(reply(&format!("{}.unknown", mux.prefix), "stray"));
        assert_eq!(mux.pending_count(), 1);
        drop(mux);
        assert!(rx.wait().is_err());
    }

    #[test]
    fn it_resolves_at_most_once() {
        let mux = RequestMultiplexer::new();
        let (_, reply_to, rx) = mux.register();

        mux.resolve(reply(&reply_to, "first"));
        mux.resolve(reply(&reply_to, "second"));

        assert_eq!(rx.wait().unwrap().unwrap().payload, "first");
    }

    #[test]
    fn it_cancels_without_resolving() {
        let mux = RequestMultiplexer::new();
        let (token, reply_to, rx) = mux.register();

        mux.cancel(&token);
        mux.resolve(reply(&reply_to, "late"));
        assert!(rx.wait().is_err());
    }

    #[test]
    fn it_translates_no_responders() {
        let msg = Message::builder()
            .subject("_INBOX.x.y")
            .sid(1u64)
            .status(Some(InlineStatus {
                code: 503,
                description: Some("No Responders".into()),
            }))
            .build()
            .unwrap();

        assert_eq!(reply_to_result(msg), Err(NatsError::NoResponders));
    }
}
