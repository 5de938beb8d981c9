//! WebSocket client for the fan-out gateway. Deliveries are forwarded to an
//! inbox session; subscriptions are managed through the returned client.

use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;

use dealroom_types::events::{ChannelName, GatewayCommand, GatewayEvent};

use crate::session::InboxHandle;

pub struct GatewayClient {
    commands: mpsc::Sender<GatewayCommand>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// `http(s)://host/base/` becomes `ws(s)://host/base/gateway?token=...`.
pub fn gateway_url(base: &Url, token: &str) -> Result<Url> {
    let mut url = base.join("gateway").context("invalid gateway base url")?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("unsupported scheme: {}", other),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot switch {} to {}", base, scheme))?;
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

impl GatewayClient {
    pub async fn connect(base: &Url, token: &str, inbox: InboxHandle) -> Result<Self> {
        let url = gateway_url(base, token)?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("gateway connect failed")?;
        let (mut sink, mut stream) = stream.split();

        let (commands, mut rx) = mpsc::channel::<GatewayCommand>(64);

        let writer = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let json = match serde_json::to_string(&command) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("Failed to encode gateway command: {}", e);
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                let text = match frame {
                    WsMessage::Text(text) => text,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };

                match serde_json::from_str::<GatewayEvent>(&text) {
                    Ok(GatewayEvent::Ready { user_id, role }) => {
                        info!("Gateway ready for {} ({})", user_id, role);
                    }
                    Ok(GatewayEvent::Event { channel, event }) => {
                        debug!("{} on {}", event.name(), channel);
                        if inbox.deliver(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(GatewayEvent::SubscribeDenied { channel, reason }) => {
                        warn!("Subscription to {} denied: {}", channel, reason);
                    }
                    Err(e) => warn!("Unreadable gateway frame: {}", e),
                }
            }
            debug!("Gateway stream ended");
        });

        Ok(Self {
            commands,
            reader,
            writer,
        })
    }

    pub async fn subscribe(&self, channel: ChannelName) -> Result<()> {
        self.command(GatewayCommand::Subscribe {
            channel: channel.to_string(),
        })
        .await
    }

    pub async fn unsubscribe(&self, channel: ChannelName) -> Result<()> {
        self.command(GatewayCommand::Unsubscribe {
            channel: channel.to_string(),
        })
        .await
    }

    async fn command(&self, command: GatewayCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("gateway connection closed"))
    }

    /// True once the server side has gone away.
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }

    /// Close the socket. Events already queued to the inbox are kept.
    pub async fn close(self) {
        drop(self.commands);
        let _ = self.writer.await;
        self.reader.abort();
    }
}
