//! Per-connection session
//!
//! A session turns wire messages into engine calls and remembers which
//! correlation ids it holds subscriptions for, so that a disconnect (or a
//! `reset`) can release every one of them.

use crate::engine::{CacheEngine, Subscriber};
use crate::key::QueryKey;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wsapi_types::{ClientMessage, CorrelationId, ServerMessage, SessionId};

/// Where the engine delivers replies for one session
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// What the transport should do after a message was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the connection open
    Continue,
    /// The peer asked to tear the channel down
    Close,
}

/// Subscriptions held by one connection
pub struct Session {
    id: SessionId,
    engine: CacheEngine,
    outbox: Outbox,
    requests: HashMap<CorrelationId, QueryKey>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("subscriptions", &self.requests.len())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(engine: CacheEngine, id: SessionId, outbox: Outbox) -> Self {
        Self {
            id,
            engine,
            outbox,
            requests: HashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Number of open subscriptions
    pub fn subscription_count(&self) -> usize {
        self.requests.len()
    }

    /// Handle a raw text frame; malformed frames are dropped
    pub fn handle_text(&mut self, text: &str) -> Disposition {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message),
            Err(err) => {
                warn!(session = %self.id, error = %err, "dropping malformed message");
                Disposition::Continue
            }
        }
    }

    /// Handle one decoded message
    pub fn handle(&mut self, message: ClientMessage) -> Disposition {
        debug!(session = %self.id, action = message.action(), id = ?message.id(), "message");

        match message {
            ClientMessage::Get { id, name, args } => {
                self.get(id, &name, args);
                Disposition::Continue
            }
            ClientMessage::Set { id, name, args } => {
                let engine = self.engine.clone();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    // Failures were already replied to the caller.
                    let _ = engine.set(id, &outbox, &name, args).await;
                });
                Disposition::Continue
            }
            ClientMessage::Kill { id } => {
                self.kill(id);
                Disposition::Continue
            }
            ClientMessage::Reset => {
                self.release_all();
                Disposition::Continue
            }
            ClientMessage::KillAll => {
                self.release_all();
                Disposition::Close
            }
        }
    }

    fn get(&mut self, id: CorrelationId, name: &str, args: Vec<serde_json::Value>) {
        // Ids are never reused while live; if a peer does it anyway the old
        // subscription must not leak.
        if self.requests.contains_key(&id) {
            debug!(session = %self.id, %id, "correlation id reused, releasing previous subscription");
            self.kill(id);
        }

        let subscriber = self.subscriber(id);
        match self.engine.subscribe(subscriber, &self.outbox, name, args) {
            Ok(key) => {
                self.requests.insert(id, key);
            }
            Err(err) => {
                warn!(session = %self.id, %id, error = %err, "rejected get");
                let _ = self.outbox.send(ServerMessage::error(id, err.to_string()));
            }
        }
    }

    /// Release the subscription held under `id`
    pub fn kill(&mut self, id: CorrelationId) -> bool {
        let Some(key) = self.requests.remove(&id) else {
            return false;
        };
        self.engine.unsubscribe(&key, self.subscriber(id))
    }

    /// Release every subscription of this session
    ///
    /// Returns how many subscriptions were released.
    pub fn release_all(&mut self) -> usize {
        let requests = std::mem::take(&mut self.requests);
        let count = requests.len();
        for (id, key) in requests {
            self.engine.unsubscribe(&key, self.subscriber(id));
        }
        count
    }

    fn subscriber(&self, id: CorrelationId) -> Subscriber {
        Subscriber {
            session: self.id,
            id,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            debug!(session = %self.id, released, "session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Definition, GetReturn};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn engine() -> CacheEngine {
        CacheEngine::new(Definition::new().get("echo", |args: Vec<Value>| async move {
            Ok(GetReturn::new(Value::Array(args)).tag("echo"))
        }))
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("outbox closed")
    }

    #[tokio::test]
    async fn test_malformed_text_is_dropped() {
        let engine = engine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = engine.open_session(tx);

        assert_eq!(session.handle_text("not json"), Disposition::Continue);
        assert_eq!(session.handle_text(r#"{"action":"get"}"#), Disposition::Continue);
        assert!(rx.try_recv().is_err());
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_function_gets_error_reply() {
        let engine = engine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = engine.open_session(tx);

        session.handle_text(r#"{"action":"get","id":4,"name":"nope","args":[]}"#);
        let reply = next(&mut rx).await;
        assert_eq!(reply.id, CorrelationId(4));
        assert!(reply.returned().is_none());
        assert_eq!(session.subscription_count(), 0);

        session.handle_text(r#"{"action":"set","id":5,"name":"nope","args":[]}"#);
        let reply = next(&mut rx).await;
        assert_eq!(reply.id, CorrelationId(5));
        assert!(reply.returned().is_none());
    }

    #[tokio::test]
    async fn test_reused_id_releases_previous_subscription() {
        let engine = engine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = engine.open_session(tx);

        session.handle_text(r#"{"action":"get","id":0,"name":"echo","args":[1]}"#);
        next(&mut rx).await;
        session.handle_text(r#"{"action":"get","id":0,"name":"echo","args":[2]}"#);
        next(&mut rx).await;

        assert_eq!(session.subscription_count(), 1);
        assert_eq!(engine.inspect("echo", &[json!(1)]).unwrap().subscribers, 0);
        assert_eq!(engine.inspect("echo", &[json!(2)]).unwrap().subscribers, 1);
    }

    #[tokio::test]
    async fn test_kill_all_closes_and_drop_releases() {
        let engine = engine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = engine.open_session(tx);

        session.handle_text(r#"{"action":"get","id":0,"name":"echo","args":[]}"#);
        next(&mut rx).await;
        assert_eq!(session.handle_text(r#"{"action":"killAll"}"#), Disposition::Close);
        assert_eq!(engine.inspect("echo", &[]).unwrap().subscribers, 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut other = engine.open_session(tx);
        other.handle_text(r#"{"action":"get","id":9,"name":"echo","args":[]}"#);
        next(&mut rx).await;
        assert_eq!(engine.inspect("echo", &[]).unwrap().subscribers, 1);

        drop(other);
        assert_eq!(engine.inspect("echo", &[]).unwrap().subscribers, 0);
    }
}
