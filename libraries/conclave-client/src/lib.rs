mod events;
mod session;

pub use events::Event;

use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use conclave_crypt::ecies::{EciesPublic, EciesSecret};
use conclave_structs::wire::{
    MakeNewKeyResponse, NewGroupKey, NewPeerKeys, Text, TextForward,
};
use conclave_structs::{Envelope, GroupId, MsgKind};

use crate::session::SessionKeys;

/// Port the relay listens on when the host string does not name one.
pub const DEFAULT_PORT: u16 = 14194;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How to enter a group at connect time.
#[derive(Clone, Debug)]
pub enum JoinMode {
    /// Ask the server to mint a fresh group.
    NewGroup,
    /// Join an existing group with its current access key.
    Join(GroupId),
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Relay host, with or without an explicit port.
    pub host: String,
    pub mode: JoinMode,
}

enum Command {
    SendText(String, oneshot::Sender<anyhow::Result<()>>),
    Disconnect,
}

/// Handle to a connected client. Dropping it tears the connection down.
pub struct Client {
    cmd_tx: mpsc::Sender<Command>,
}

impl Client {
    /// Connect to the relay and start the receive dispatcher.
    ///
    /// Domain events (key updates, messages, connection changes) arrive on
    /// the returned channel.
    pub async fn connect(
        config: ClientConfig,
    ) -> anyhow::Result<(Self, async_channel::Receiver<Event>)> {
        let long_term = EciesSecret::random();
        let request = build_request(&config, &long_term.public_key())?;
        let (stream, _response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request))
            .await
            .context("websocket handshake timed out")?
            .context("websocket handshake failed")?;

        let (event_tx, event_rx) = async_channel::unbounded();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let _ = event_tx.send(Event::ConnectionChange(true)).await;
        tokio::spawn(run(stream, SessionKeys::new(long_term), cmd_rx, event_tx));
        Ok((Self { cmd_tx }, event_rx))
    }

    /// Encrypt and send a text message under the current ratchet state.
    ///
    /// Fails while no shared key is established (before the first rekey
    /// completes) or after the connection has gone down.
    pub async fn send_text(&self, contents: impl Into<String>) -> anyhow::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendText(contents.into(), done_tx))
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))?;
        done_rx.await.map_err(|_| anyhow::anyhow!("connection closed"))?
    }

    /// Close the connection and wipe the session's key state.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }
}

fn build_request(config: &ClientConfig, long_term: &EciesPublic) -> anyhow::Result<Request> {
    let host = if config.host.contains(':') {
        config.host.clone()
    } else {
        format!("{}:{}", config.host, DEFAULT_PORT)
    };
    let mut request = format!("ws://{host}/ws")
        .into_client_request()
        .context("invalid relay address")?;
    let headers = request.headers_mut();
    match &config.mode {
        JoinMode::NewGroup => {
            headers.insert("makenew", HeaderValue::from_static("yes"));
        }
        JoinMode::Join(key) => {
            headers.insert("key", HeaderValue::from_str(&key.to_string())?);
        }
    }
    headers.insert("longterm", HeaderValue::from_str(&long_term.to_string())?);
    Ok(request)
}

async fn run(
    stream: WsStream,
    mut keys: SessionKeys,
    mut cmd_rx: mpsc::Receiver<Command>,
    events: async_channel::Sender<Event>,
) {
    let (mut sink, mut source) = stream.split();
    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                incoming = source.next() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => return Err(err).context("websocket read failed"),
                        None => return Ok(()),
                    };
                    match message {
                        Message::Text(raw) => {
                            handle_frame(&raw, &mut keys, &mut sink, &events).await?;
                        }
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::SendText(contents, done)) => {
                            let outcome = send_text(&contents, &mut keys, &mut sink, &events).await;
                            let _ = done.send(outcome);
                        }
                        Some(Command::Disconnect) | None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
    .await;

    if let Err(err) = result {
        warn!(error = %err, "client connection ended");
    }
    let _ = events.send(Event::ConnectionChange(false)).await;
}

async fn handle_frame(
    raw: &str,
    keys: &mut SessionKeys,
    sink: &mut SplitSink<WsStream, Message>,
    events: &async_channel::Sender<Event>,
) -> anyhow::Result<()> {
    let envelope = match Envelope::decode(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "dropping malformed frame");
            return Ok(());
        }
    };
    match envelope.kind {
        MsgKind::NewGroupKey => {
            let payload: NewGroupKey = match envelope.payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "dropping bad group key payload");
                    return Ok(());
                }
            };
            match keys.handle_new_group_key(&payload.new_key) {
                Ok(group) => {
                    debug!(group = %group, "group access key rotated");
                    let _ = events.send(Event::KeyUpdate(group)).await;
                }
                Err(err) => warn!(error = %err, "failed to unseal rotated group key"),
            }
        }
        MsgKind::MakeNewKey => {
            let public = keys.begin_rekey();
            let reply = Envelope::pack(MsgKind::MakeNewKey, &MakeNewKeyResponse { public })
                .context("failed to encode rekey reply")?;
            let raw = reply.encode().context("failed to encode rekey reply")?;
            sink.send(Message::Text(raw))
                .await
                .context("failed to send rekey reply")?;
        }
        MsgKind::NewPeerKeys => {
            let payload: NewPeerKeys = match envelope.payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "dropping bad peer key payload");
                    return Ok(());
                }
            };
            match keys.install_peer_keys(&payload.keys) {
                Ok(()) => debug!(peers = payload.keys.len(), "shared key derived"),
                Err(err) => warn!(error = %err, "failed to derive shared key"),
            }
        }
        MsgKind::Text => {
            let payload: TextForward = match envelope.payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "dropping bad text payload");
                    return Ok(());
                }
            };
            // A message we cannot open leaves the ratchet out of step with
            // every peer, so the connection cannot continue.
            let plaintext = keys
                .open_text(&payload.contents)
                .context("failed to decrypt incoming message")?;
            let _ = events
                .send(Event::Message {
                    sender: Some(payload.sender),
                    body: String::from_utf8_lossy(&plaintext).into_owned(),
                    from_self: false,
                })
                .await;
        }
    }
    Ok(())
}

async fn send_text(
    contents: &str,
    keys: &mut SessionKeys,
    sink: &mut SplitSink<WsStream, Message>,
    events: &async_channel::Sender<Event>,
) -> anyhow::Result<()> {
    let sealed = keys
        .seal_text(contents.as_bytes())
        .context("cannot encrypt yet")?;
    let envelope = Envelope::pack(MsgKind::Text, &Text { contents: sealed })
        .context("failed to encode text message")?;
    let raw = envelope.encode().context("failed to encode text message")?;
    sink.send(Message::Text(raw))
        .await
        .context("failed to send text message")?;
    let _ = events
        .send(Event::Message {
            sender: None,
            body: contents.to_owned(),
            from_self: true,
        })
        .await;
    Ok(())
}
