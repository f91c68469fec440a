//! Client connections to a remote wsapi daemon.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, warn};
use wsapi_core::{ChannelTransport, Client};
use wsapi_types::ServerMessage;

/// Open a WebSocket to `url` and return a client speaking over it.
///
/// The connection closes once every handle of the client is gone.
pub async fn connect(url: &str) -> Result<Client> {
    let (stream, _) = connect_async(url).await?;
    let (mut sink, mut source) = stream.split();

    let (transport, mut outgoing) = ChannelTransport::new();
    let client = Client::new(transport);
    let weak = client.downgrade();
    let url = url.to_string();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = outgoing.recv() => {
                    let Some(message) = message else {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    };
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode request");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(reply) => {
                                if let Some(client) = weak.upgrade() {
                                    client.dispatch(reply);
                                }
                            }
                            Err(err) => warn!(error = %err, "dropping malformed reply"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        warn!(%url, error = %err, "websocket receive failed");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
        debug!(%url, "remote connection closed");
    });

    Ok(client)
}
