//! Broadcast relay transport
//!
//! Lets several in-process peers share one authority. A [`RelayMaster`]
//! holds a [`Client`] connected to the real server and listens on the
//! hub's main channel (`prefix`). A peer announces its name there and both
//! sides then talk on a pair of sub-channels: the peer sends
//! [`ClientMessage`]s on `prefix/name`, the master answers with
//! [`ServerMessage`]s on `prefix/name/replies` by forwarding through its own
//! client. A burst of pushes therefore never crowds out peer requests.
//!
//! Broadcast receivers only see frames sent after they subscribed, so a peer
//! holds its outgoing frames until the master signals [`RelayFrame::Ready`].

use crate::client::{CallbackId, ChannelTransport, Client, LiveQuery};
use crate::error::ClientError;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wsapi_types::{ClientMessage, CorrelationId, ServerMessage};

/// Main channel name used when none is given
pub const DEFAULT_PREFIX: &str = "@ws-api";

const CHANNEL_CAPACITY: usize = 256;

/// A frame on a relay channel
#[derive(Debug, Clone)]
pub enum RelayFrame {
    /// A peer introduces itself on the main channel
    Announce(String),
    /// The master is listening on the sub-channel
    Ready,
    /// Peer to master
    Request(ClientMessage),
    /// Master to peer
    Reply(ServerMessage),
}

/// Registry of named broadcast channels
#[derive(Clone, Default)]
pub struct RelayHub {
    channels: Arc<DashMap<String, broadcast::Sender<RelayFrame>>>,
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender for channel `name`, created on first use
    pub fn channel(&self, name: &str) -> broadcast::Sender<RelayFrame> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Forget channel `name`
    pub fn close(&self, name: &str) -> bool {
        self.channels.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }
}

fn sub_channel(prefix: &str, name: &str) -> String {
    format!("{prefix}/{name}")
}

fn reply_channel(channel: &str) -> String {
    format!("{channel}/replies")
}

/// Serves relay peers by forwarding to a client of the authority
#[derive(Debug)]
pub struct RelayMaster {
    task: JoinHandle<()>,
}

impl RelayMaster {
    /// Start listening for peers on `prefix`
    pub fn spawn(hub: &RelayHub, client: Client, prefix: &str) -> Self {
        let hub = hub.clone();
        let prefix = prefix.to_string();
        let mut announcements = hub.channel(&prefix).subscribe();

        let task = tokio::spawn(async move {
            info!(%prefix, "relay master listening");
            loop {
                match announcements.recv().await {
                    Ok(RelayFrame::Announce(name)) => {
                        let channel = sub_channel(&prefix, &name);
                        debug!(%channel, "relay peer announced");
                        tokio::spawn(serve_peer(hub.clone(), client.clone(), channel));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "relay master lagged behind announcements");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { task }
    }

    /// Stop accepting new peers
    ///
    /// Peers already being served keep running until they disconnect.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for RelayMaster {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One forwarded subscription
struct Forward {
    query: LiveQuery,
    callback: Option<CallbackId>,
}

impl Forward {
    fn release(self) {
        if let Some(callback) = self.callback {
            self.query.unsubscribe(callback);
        }
        self.query.kill();
    }
}

async fn serve_peer(hub: RelayHub, client: Client, channel: String) {
    let mut rx = hub.channel(&channel).subscribe();
    let replies = reply_channel(&channel);
    let tx = hub.channel(&replies);
    let _ = tx.send(RelayFrame::Ready);

    let mut live: HashMap<CorrelationId, Forward> = HashMap::new();
    loop {
        let message = match rx.recv().await {
            Ok(RelayFrame::Request(message)) => message,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(%channel, skipped = n, "relay master dropped peer requests");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match message {
            ClientMessage::Get { id, name, args } => {
                if let Some(previous) = live.remove(&id) {
                    previous.release();
                }
                if let Some(forward) = forward_get(&client, &tx, id, &name, args) {
                    live.insert(id, forward);
                }
            }
            ClientMessage::Set { id, name, args } => {
                let client = client.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let reply = match client.set(&name, args).await {
                        Ok(value) => ServerMessage::value(id, value),
                        Err(ClientError::Rejected { message, .. }) => ServerMessage::error(id, message),
                        Err(err) => ServerMessage::error(id, err.to_string()),
                    };
                    let _ = tx.send(RelayFrame::Reply(reply));
                });
            }
            ClientMessage::Kill { id } => {
                if let Some(forward) = live.remove(&id) {
                    forward.release();
                }
            }
            ClientMessage::Reset => {
                live.drain().for_each(|(_, forward)| forward.release());
            }
            ClientMessage::KillAll => {
                hub.close(&channel);
                hub.close(&replies);
                break;
            }
        }
    }

    let released = live.len();
    live.drain().for_each(|(_, forward)| forward.release());
    debug!(%channel, released, "relay peer closed");
}

fn forward_get(
    client: &Client,
    tx: &broadcast::Sender<RelayFrame>,
    id: CorrelationId,
    name: &str,
    args: Vec<serde_json::Value>,
) -> Option<Forward> {
    let query = match client.get(name, args) {
        Ok(query) => query,
        Err(err) => {
            let _ = tx.send(RelayFrame::Reply(ServerMessage::error(id, err.to_string())));
            return None;
        }
    };

    let push = tx.clone();
    let callback = query.subscribe(move |value| {
        let _ = push.send(RelayFrame::Reply(ServerMessage::value(id, value.clone())));
    });

    // Values arrive through the callback; a rejection only shows up in the
    // snapshot.
    let mut updates = query.watch();
    let errors = tx.clone();
    tokio::spawn(async move {
        let message = match updates
            .wait_for(|s| s.value.is_some() || s.error.is_some())
            .await
        {
            Ok(snapshot) if snapshot.value.is_none() => snapshot.error.clone(),
            _ => None,
        };
        if let Some(message) = message {
            let _ = errors.send(RelayFrame::Reply(ServerMessage::error(id, message)));
        }
    });

    Some(Forward { query, callback })
}

/// Connect a client to the relay master listening on `prefix`
///
/// Dropping every handle of the returned client tells the master to release
/// the peer's subscriptions and close its sub-channels.
pub fn connect(hub: &RelayHub, name: &str, prefix: &str) -> Client {
    let channel_name = sub_channel(prefix, name);
    let channel = hub.channel(&channel_name);
    let mut incoming = hub.channel(&reply_channel(&channel_name)).subscribe();

    let (transport, mut outgoing) = ChannelTransport::new();
    let client = Client::new(transport);
    let weak = client.downgrade();

    if hub
        .channel(prefix)
        .send(RelayFrame::Announce(name.to_string()))
        .is_err()
    {
        warn!(%prefix, "no relay master listening");
    }

    tokio::spawn(async move {
        let mut ready = false;
        let mut queued: VecDeque<ClientMessage> = VecDeque::new();

        loop {
            tokio::select! {
                frame = incoming.recv() => match frame {
                    Ok(RelayFrame::Ready) => {
                        ready = true;
                        for message in queued.drain(..) {
                            let _ = channel.send(RelayFrame::Request(message));
                        }
                    }
                    Ok(RelayFrame::Reply(reply)) => {
                        // A gone client is noticed when `outgoing` closes.
                        if let Some(client) = weak.upgrade() {
                            client.dispatch(reply);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(channel = %channel_name, skipped = n, "relay peer lagged behind master");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                outbound = outgoing.recv() => match outbound {
                    Some(message) if ready => {
                        let _ = channel.send(RelayFrame::Request(message));
                    }
                    Some(message) => queued.push_back(message),
                    None => {
                        let _ = channel.send(RelayFrame::Request(ClientMessage::KillAll));
                        break;
                    }
                },
            }
        }
    });

    client
}
