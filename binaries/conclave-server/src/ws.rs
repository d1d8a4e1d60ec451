use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::{debug, info, warn};
use conclave_crypt::ecies::EciesPublic;
use conclave_structs::wire::{MakeNewKeyResponse, Text, TextForward};
use conclave_structs::{Envelope, GroupId, MemberId, MsgKind};

use crate::registry::{GroupRef, Member, Registry};
use crate::rekey::{self, RekeyTrigger};
use crate::slot::KeySlot;

/// Best-effort deadline on the closing frame of an evicted connection.
const CLOSE_DEADLINE: Duration = Duration::from_millis(100);

const OUTBOUND_QUEUE: usize = 64;

enum Ticket {
    NewGroup,
    Join(GroupId),
}

enum Admission {
    NewGroup,
    Join(GroupRef),
}

pub async fn ws_handler(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ticket = match parse_ticket(&headers) {
        Ok(ticket) => ticket,
        Err(status) => return status.into_response(),
    };
    let admission = match ticket {
        Ticket::NewGroup => Admission::NewGroup,
        Ticket::Join(key) => match registry.authenticate(&key) {
            Some(gref) => Admission::Join(gref),
            None => {
                debug!(key = %key, "join with unknown access key");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        },
    };
    let long_term = match parse_long_term(&headers) {
        Ok(key) => key,
        Err(status) => return status.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, registry, admission, long_term))
        .into_response()
}

fn parse_ticket(headers: &HeaderMap) -> Result<Ticket, StatusCode> {
    if headers
        .get("makenew")
        .is_some_and(|value| value.as_bytes() == b"yes")
    {
        return Ok(Ticket::NewGroup);
    }
    let raw = headers
        .get("key")
        .and_then(|value| value.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let key = raw.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok(Ticket::Join(key))
}

fn parse_long_term(headers: &HeaderMap) -> Result<EciesPublic, StatusCode> {
    headers
        .get("longterm")
        .and_then(|value| value.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?
        .parse()
        .map_err(|_| StatusCode::BAD_REQUEST)
}

async fn handle_socket(
    socket: WebSocket,
    registry: Arc<Registry>,
    admission: Admission,
    long_term: EciesPublic,
) {
    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    tokio::spawn(write_loop(sink, out_rx));

    let gref = match admission {
        Admission::NewGroup => registry.create_group().0,
        Admission::Join(gref) => gref,
    };

    let member_id = MemberId::random();
    let member = Member {
        id: member_id,
        long_term,
        short_term: None,
        pending: Arc::new(KeySlot::new()),
        outbound: out_tx.clone(),
    };
    if !registry.add_member(gref, member) {
        // The group emptied out between the header check and the upgrade
        // completing.
        debug!(member = %member_id, "group disappeared during upgrade");
        let _ = out_tx.try_send(Message::Close(None));
        return;
    }
    info!(member = %member_id, "member admitted");

    let cleanup_registry = registry.clone();
    let _cleanup = scopeguard::guard((), move |_| {
        cleanup_registry.nuke(member_id);
    });

    rekey::rotate_group_key(&registry, gref).await;

    let (ready_tx, ready_rx) = oneshot::channel();
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            // Wait until the new member's receive loop is live so its rekey
            // reply has somewhere to land; a dropped sender means the
            // connection already died and the round will evict it.
            let _ = ready_rx.await;
            rekey::do_rekey(registry, gref, RekeyTrigger::Admission).await;
        });
    }

    read_loop(stream, &registry, member_id, ready_tx).await;
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if matches!(message, Message::Close(_)) {
            let _ = tokio::time::timeout(CLOSE_DEADLINE, sink.send(message)).await;
            break;
        }
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    registry: &Arc<Registry>,
    member_id: MemberId,
    ready: oneshot::Sender<()>,
) {
    let _ = ready.send(());
    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                debug!(member = %member_id, error = %err, "transport read failed");
                break;
            }
        };
        match message {
            Message::Text(raw) => dispatch(registry, member_id, raw.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn dispatch(registry: &Arc<Registry>, member_id: MemberId, raw: &str) {
    let envelope = match Envelope::decode(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(member = %member_id, error = %err, "dropping malformed frame");
            return;
        }
    };
    match envelope.kind {
        MsgKind::MakeNewKey => {
            let payload: MakeNewKeyResponse = match envelope.payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(member = %member_id, error = %err, "dropping bad short-term key");
                    return;
                }
            };
            if !registry.offer_pending(member_id, payload.public) {
                debug!(member = %member_id, "discarding unsolicited short-term key");
            }
        }
        MsgKind::Text => {
            let payload: Text = match envelope.payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(member = %member_id, error = %err, "dropping bad text payload");
                    return;
                }
            };
            let forward = TextForward {
                contents: payload.contents,
                sender: member_id,
            };
            let raw = match Envelope::pack(MsgKind::Text, &forward)
                .and_then(|envelope| envelope.encode())
            {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(member = %member_id, error = %err, "cannot encode forward");
                    return;
                }
            };
            for (peer, outbound) in registry.peers_of(member_id) {
                if outbound.send(Message::Text(raw.clone().into())).await.is_err() {
                    warn!(member = %peer, "cannot forward message, evicting");
                    registry.nuke(peer);
                }
            }
            if let Some(gref) = registry.bump_counter(member_id) {
                debug!(member = %member_id, "relay cadence reached, rekeying");
                let registry = registry.clone();
                tokio::spawn(rekey::do_rekey(registry, gref, RekeyTrigger::Counter));
            }
        }
        kind => {
            warn!(member = %member_id, kind = ?kind, "unexpected frame from client");
        }
    }
}
