//! Client request multiplexer
//!
//! The client side mirrors the engine: concurrent `get`s for the same query
//! key share one server subscription, tracked in an arena owned by the
//! [`Client`] and indexed by key. Every caller receives its own
//! [`LiveQuery`] guard; the subscription is released to the server when the
//! last guard is killed or dropped.

use crate::engine::CacheEngine;
use crate::error::{ClientError, ClientResult, TransportError};
use crate::key::QueryKey;
use crate::session::Disposition;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use wsapi_types::{ClientMessage, CorrelationId, ReplyBody, ServerMessage};

/// Outgoing half of a connection
pub trait Transport: Send + Sync + 'static {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError>;
}

/// Transport that hands messages to an in-process channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl ChannelTransport {
    /// Create a transport and the receiver its messages arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }
}

/// Identifies a callback registered with [`LiveQuery::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// A registered callback and the newest update it was handed
#[derive(Clone)]
struct Listener {
    id: CallbackId,
    callback: Callback,
    delivered: Arc<Mutex<u64>>,
}

impl Listener {
    fn new(id: CallbackId, callback: Callback) -> Self {
        Self {
            id,
            callback,
            delivered: Arc::new(Mutex::new(0)),
        }
    }

    /// Call back with update number `update` unless a newer one already went out
    fn deliver(&self, update: u64, value: &Value) {
        let mut delivered = self.delivered.lock();
        if update <= *delivered {
            return;
        }
        *delivered = update;
        (self.callback)(value);
    }
}

/// What a handle currently knows about its query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Latest pushed value
    pub value: Option<Value>,
    /// Set when the server rejected the query or its computation failed
    pub error: Option<String>,
    /// Number of values received so far
    pub updates: u64,
}

/// Shared state of one server subscription
struct HandleSlot {
    id: CorrelationId,
    instances: usize,
    snapshot: watch::Sender<Snapshot>,
    listeners: Vec<Listener>,
}

enum Pending {
    Get(QueryKey),
    Set(oneshot::Sender<Result<Value, String>>),
}

#[derive(Default)]
struct ClientState {
    next_id: u64,
    next_callback: u64,
    handles: HashMap<QueryKey, HandleSlot>,
    pending: HashMap<CorrelationId, Pending>,
}

impl ClientState {
    fn allocate_id(&mut self) -> CorrelationId {
        let id = CorrelationId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Slot for `key`, as long as it still belongs to subscription `id`
    fn slot_mut(&mut self, key: &QueryKey, id: CorrelationId) -> Option<&mut HandleSlot> {
        self.handles.get_mut(key).filter(|slot| slot.id == id)
    }
}

struct ClientInner {
    transport: Box<dyn Transport>,
    state: Mutex<ClientState>,
}

/// Multiplexes `get` subscriptions and `set` calls over one transport
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Non-owning reference to a [`Client`], used by receive loops
#[derive(Clone)]
pub struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    pub fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

impl std::fmt::Debug for WeakClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakClient")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Client")
            .field("handles", &state.handles.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Client {
    pub fn new(transport: impl Transport) -> Self {
        Client {
            inner: Arc::new(ClientInner {
                transport: Box::new(transport),
                state: Mutex::new(ClientState::default()),
            }),
        }
    }

    /// Connect a client to a session of an in-process engine
    pub fn local(engine: &CacheEngine) -> Self {
        let (transport, mut requests) = ChannelTransport::new();
        let (outbox, mut replies) = mpsc::unbounded_channel();
        let mut session = engine.open_session(outbox);
        let client = Client::new(transport);

        // Ends when every clone of the client is gone; dropping the session
        // releases whatever it still holds.
        tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                if session.handle(message) == Disposition::Close {
                    break;
                }
            }
        });

        let weak = client.downgrade();
        tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                let Some(client) = weak.upgrade() else {
                    break;
                };
                client.dispatch(reply);
            }
        });

        client
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to `(name, args)`, sharing an existing subscription if any
    pub fn get(&self, name: &str, args: Vec<Value>) -> ClientResult<LiveQuery> {
        let key = QueryKey::encode(name, &args);
        let mut state = self.inner.state.lock();

        if let Some(slot) = state.handles.get_mut(&key) {
            slot.instances += 1;
            return Ok(LiveQuery {
                client: self.clone(),
                key,
                id: slot.id,
                snapshot: slot.snapshot.subscribe(),
                released: false,
            });
        }

        let id = state.allocate_id();
        self.inner.transport.send(ClientMessage::Get {
            id,
            name: name.to_string(),
            args,
        })?;

        let (snapshot, receiver) = watch::channel(Snapshot::default());
        state.handles.insert(
            key.clone(),
            HandleSlot {
                id,
                instances: 1,
                snapshot,
                listeners: Vec::new(),
            },
        );
        state.pending.insert(id, Pending::Get(key.clone()));

        Ok(LiveQuery {
            client: self.clone(),
            key,
            id,
            snapshot: receiver,
            released: false,
        })
    }

    /// Call the `set` function `name` and wait for its reply
    pub async fn set(&self, name: &str, args: Vec<Value>) -> ClientResult<Value> {
        let (id, reply) = {
            let mut state = self.inner.state.lock();
            let id = state.allocate_id();
            self.inner.transport.send(ClientMessage::Set {
                id,
                name: name.to_string(),
                args,
            })?;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(id, Pending::Set(tx));
            (id, rx)
        };

        match reply.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ClientError::Rejected { id, message }),
            Err(_) => Err(ClientError::Abandoned(id)),
        }
    }

    /// Release everything on the server and forget all local handles
    ///
    /// Outstanding [`LiveQuery`] guards keep their last value but no longer
    /// receive updates.
    pub fn reset(&self) -> ClientResult<()> {
        let mut state = self.inner.state.lock();
        self.inner.transport.send(ClientMessage::Reset)?;
        state.handles.clear();
        state
            .pending
            .retain(|_, pending| matches!(pending, Pending::Set(_)));
        Ok(())
    }

    /// Number of distinct live subscriptions
    pub fn live_count(&self) -> usize {
        self.inner.state.lock().handles.len()
    }

    /// Route one incoming reply to the handle or call awaiting it
    pub fn dispatch(&self, message: ServerMessage) {
        let mut state = self.inner.state.lock();

        let key = match state.pending.get(&message.id) {
            Some(Pending::Get(key)) => key.clone(),
            Some(Pending::Set(_)) => {
                if let Some(Pending::Set(tx)) = state.pending.remove(&message.id) {
                    let _ = tx.send(match message.body {
                        ReplyBody::Return(value) => Ok(value),
                        ReplyBody::Error(err) => Err(err),
                    });
                }
                return;
            }
            None => {
                debug!(id = %message.id, "reply for unknown request");
                return;
            }
        };

        let Some(slot) = state.slot_mut(&key, message.id) else {
            return;
        };
        match message.body {
            ReplyBody::Return(value) => {
                let mut update = 0;
                slot.snapshot.send_modify(|snapshot| {
                    snapshot.value = Some(value.clone());
                    snapshot.error = None;
                    snapshot.updates += 1;
                    update = snapshot.updates;
                });
                let listeners = slot.listeners.clone();
                drop(state);
                for listener in listeners {
                    listener.deliver(update, &value);
                }
            }
            ReplyBody::Error(err) => {
                warn!(id = %message.id, error = %err, "live query failed");
                slot.snapshot.send_modify(|snapshot| snapshot.error = Some(err));
            }
        }
    }

    fn retain(&self, key: &QueryKey, id: CorrelationId) -> bool {
        let mut state = self.inner.state.lock();
        match state.slot_mut(key, id) {
            Some(slot) => {
                slot.instances += 1;
                true
            }
            None => false,
        }
    }

    fn release(&self, key: &QueryKey, id: CorrelationId) {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.slot_mut(key, id) else {
            // Already forgotten by a reset.
            return;
        };
        slot.instances -= 1;
        if slot.instances > 0 {
            return;
        }

        if let Some(slot) = state.handles.remove(key) {
            slot.snapshot.send_replace(Snapshot::default());
        }
        state.pending.remove(&id);
        if let Err(err) = self.inner.transport.send(ClientMessage::Kill { id }) {
            debug!(%id, error = %err, "could not send kill");
        }
    }

    fn add_callback(&self, key: &QueryKey, id: CorrelationId, callback: Callback) -> Option<CallbackId> {
        let mut state = self.inner.state.lock();
        let callback_id = CallbackId(state.next_callback);
        state.next_callback += 1;

        let slot = state.slot_mut(key, id)?;
        let listener = Listener::new(callback_id, callback);
        slot.listeners.push(listener.clone());
        let (current, update) = {
            let snapshot = slot.snapshot.borrow();
            (snapshot.value.clone(), snapshot.updates)
        };
        drop(state);

        // Late subscribers catch up with the known value, unless a push
        // that raced this call already delivered something newer.
        if let Some(value) = current {
            listener.deliver(update, &value);
        }
        Some(callback_id)
    }

    fn remove_callback(&self, key: &QueryKey, id: CorrelationId, callback: CallbackId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.slot_mut(key, id) else {
            return false;
        };
        let before = slot.listeners.len();
        slot.listeners.retain(|listener| listener.id != callback);
        slot.listeners.len() != before
    }

    fn instances(&self, key: &QueryKey, id: CorrelationId) -> usize {
        let mut state = self.inner.state.lock();
        state.slot_mut(key, id).map_or(0, |slot| slot.instances)
    }
}

/// One caller's reference to a shared live query
///
/// Dropping the guard is the same as calling [`kill`](Self::kill).
pub struct LiveQuery {
    client: Client,
    key: QueryKey,
    id: CorrelationId,
    snapshot: watch::Receiver<Snapshot>,
    released: bool,
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("value", &self.snapshot.borrow().value)
            .finish()
    }
}

impl LiveQuery {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Correlation id of the shared server subscription
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Latest known value
    pub fn value(&self) -> Option<Value> {
        self.snapshot.borrow().value.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every update of this query
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Number of guards sharing the subscription
    pub fn instances(&self) -> usize {
        self.client.instances(&self.key, self.id)
    }

    /// Wait until a value is known
    pub async fn loaded(&self) -> ClientResult<Value> {
        let mut rx = self.snapshot.clone();
        let snapshot = match rx
            .wait_for(|s| s.value.is_some() || s.error.is_some())
            .await
        {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => return Err(ClientError::Abandoned(self.id)),
        };

        match (snapshot.value, snapshot.error) {
            (Some(value), _) => Ok(value),
            (None, Some(message)) => Err(ClientError::Rejected {
                id: self.id,
                message,
            }),
            (None, None) => Err(ClientError::Abandoned(self.id)),
        }
    }

    /// Wait for the next pushed value
    pub async fn changed(&mut self) -> Option<Value> {
        self.snapshot.changed().await.ok()?;
        self.value()
    }

    /// Call `callback` with every new value, starting with the current one
    ///
    /// Returns `None` if the subscription was already released.
    pub fn subscribe(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> Option<CallbackId> {
        self.client.add_callback(&self.key, self.id, Arc::new(callback))
    }

    pub fn unsubscribe(&self, callback: CallbackId) -> bool {
        self.client.remove_callback(&self.key, self.id, callback)
    }

    /// Give up this guard's share of the subscription
    pub fn kill(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.client.release(&self.key, self.id);
        }
    }
}

impl Clone for LiveQuery {
    /// Another guard on the same subscription
    fn clone(&self) -> Self {
        let live = !self.released && self.client.retain(&self.key, self.id);
        LiveQuery {
            client: self.client.clone(),
            key: self.key.clone(),
            id: self.id,
            snapshot: self.snapshot.clone(),
            released: !live,
        }
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> (Client, mpsc::UnboundedReceiver<ClientMessage>) {
        let (transport, rx) = ChannelTransport::new();
        (Client::new(transport), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_get_deduplicates() {
        let (client, mut rx) = client();

        let a = client.get("item", vec![json!(1)]).unwrap();
        let b = client.get("item", vec![json!(1)]).unwrap();
        let c = client.get("item", vec![json!(2)]).unwrap();

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.instances(), 2);

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].action(), "get");
    }

    #[test]
    fn test_kill_only_at_last_instance() {
        let (client, mut rx) = client();

        let a = client.get("item", vec![json!(1)]).unwrap();
        let b = client.get("item", vec![json!(1)]).unwrap();
        let id = a.id();
        drain(&mut rx);

        a.kill();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(b.instances(), 1);

        drop(b);
        assert_eq!(drain(&mut rx), vec![ClientMessage::Kill { id }]);
        assert_eq!(client.live_count(), 0);
    }

    #[test]
    fn test_dispatch_updates_value_and_callbacks() {
        let (client, _rx) = client();
        let query = client.get("item", vec![json!(1)]).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb = query
            .subscribe(move |v| sink.lock().push(v.clone()))
            .unwrap();

        client.dispatch(ServerMessage::value(query.id(), json!("a")));
        assert_eq!(query.value(), Some(json!("a")));

        // A late subscriber is called with the known value immediately.
        let late = Arc::new(Mutex::new(Vec::new()));
        let late_sink = late.clone();
        query.subscribe(move |v| late_sink.lock().push(v.clone()));
        assert_eq!(*late.lock(), vec![json!("a")]);

        assert!(query.unsubscribe(cb));
        client.dispatch(ServerMessage::value(query.id(), json!("b")));

        assert_eq!(*seen.lock(), vec![json!("a")]);
        assert_eq!(*late.lock(), vec![json!("a"), json!("b")]);
        assert_eq!(query.snapshot().updates, 2);
    }

    #[test]
    fn test_listener_skips_older_updates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = Listener::new(CallbackId(0), Arc::new(move |v: &Value| sink.lock().push(v.clone())));

        listener.deliver(2, &json!("b"));
        listener.deliver(1, &json!("a"));
        listener.deliver(2, &json!("b"));
        listener.deliver(3, &json!("c"));
        assert_eq!(*seen.lock(), vec![json!("b"), json!("c")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribe_racing_dispatch_ends_on_latest() {
        const PUSHES: u64 = 200;
        let (client, _rx) = client();
        let query = client.get("item", vec![json!(1)]).unwrap();
        client.dispatch(ServerMessage::value(query.id(), json!(0)));

        let pusher = tokio::spawn({
            let client = client.clone();
            let id = query.id();
            async move {
                for n in 1..=PUSHES {
                    client.dispatch(ServerMessage::value(id, json!(n)));
                    tokio::task::yield_now().await;
                }
            }
        });

        let mut sinks = Vec::new();
        while !pusher.is_finished() {
            let sink = Arc::new(Mutex::new(Vec::<u64>::new()));
            let seen = sink.clone();
            query
                .subscribe(move |v| seen.lock().push(v.as_u64().unwrap()))
                .unwrap();
            sinks.push(sink);
            tokio::task::yield_now().await;
        }
        pusher.await.unwrap();

        for sink in sinks {
            let seen = sink.lock();
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
            assert_eq!(seen.last(), Some(&PUSHES));
        }
    }

    #[test]
    fn test_unknown_reply_is_ignored() {
        let (client, _rx) = client();
        client.dispatch(ServerMessage::value(CorrelationId(99), json!(1)));
        assert_eq!(client.live_count(), 0);
    }

    #[tokio::test]
    async fn test_set_resolves_once() {
        let (client, mut rx) = client();
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.set("touch", vec![json!(1)]).await }
        });

        let id = loop {
            if let Some(ClientMessage::Set { id, .. }) = rx.recv().await {
                break id;
            }
        };
        client.dispatch(ServerMessage::value(id, json!(true)));
        // A duplicate reply has nobody left to resolve.
        client.dispatch(ServerMessage::value(id, json!(false)));

        assert_eq!(pending.await.unwrap().unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_loaded_reports_rejection() {
        let (client, _rx) = client();
        let query = client.get("nope", vec![]).unwrap();
        client.dispatch(ServerMessage::error(query.id(), "unknown get function `nope`"));

        let err = query.loaded().await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { .. }));
    }

    #[test]
    fn test_reset_forgets_handles() {
        let (client, mut rx) = client();
        let query = client.get("item", vec![json!(1)]).unwrap();
        drain(&mut rx);

        client.reset().unwrap();
        assert_eq!(drain(&mut rx), vec![ClientMessage::Reset]);
        assert_eq!(client.live_count(), 0);

        // The server already released it, so no kill follows.
        drop(query);
        assert!(drain(&mut rx).is_empty());

        // A fresh get after reset subscribes again with a new id.
        let again = client.get("item", vec![json!(1)]).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(again.instances(), 1);
    }

    #[test]
    fn test_clone_shares_subscription() {
        let (client, mut rx) = client();
        let a = client.get("item", vec![json!(1)]).unwrap();
        let b = a.clone();
        drain(&mut rx);

        assert_eq!(b.instances(), 2);
        drop(a);
        assert!(drain(&mut rx).is_empty());
        drop(b);
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
