use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures_concurrency::future::Join;
use tokio::time::Duration;
use tracing::{debug, warn};
use conclave_structs::wire::{MakeNewKeyRequest, NewGroupKey, NewPeerKeys};
use conclave_structs::{Envelope, MemberId, MsgKind};

use crate::registry::{GroupRef, Registry};

/// How long a member has to answer a `MakeNewKey` request before eviction.
pub const REKEY_DEADLINE: Duration = Duration::from_secs(3);

/// What started a rekey round; decides the behavior at the per-group gate.
#[derive(Clone, Copy, Debug)]
pub enum RekeyTrigger {
    /// A membership change. Queues behind any in-flight round.
    Admission,
    /// The relay counter. Skipped when a round is already in flight.
    Counter,
}

/// Rotate the group's access key and deliver the new token to every member,
/// sealed to each member's long-term key. A member we cannot seal to or
/// reach is evicted and the distribution continues.
pub async fn rotate_group_key(registry: &Arc<Registry>, gref: GroupRef) {
    let Some((new_key, targets)) = registry.rotate_access_key(gref) else {
        return;
    };
    debug!(group = %new_key, members = targets.len(), "rotating group access key");
    for target in targets {
        let sealed = match target.long_term.encrypt(&new_key.to_bytes()) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!(member = %target.id, error = %err, "cannot seal access key, evicting");
                registry.nuke(target.id);
                continue;
            }
        };
        let raw = match Envelope::pack(MsgKind::NewGroupKey, &NewGroupKey { new_key: sealed })
            .and_then(|envelope| envelope.encode())
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(member = %target.id, error = %err, "cannot encode access key envelope");
                continue;
            }
        };
        if target.outbound.send(Message::Text(raw.into())).await.is_err() {
            warn!(member = %target.id, "cannot deliver access key, evicting");
            registry.nuke(target.id);
        }
    }
}

/// Run one synchronous rekey round over the group's current membership:
/// request fresh short-term keys from everyone, collect the replies under a
/// deadline (evicting members that miss it), then publish to each survivor
/// the roster's keys minus its own.
pub async fn do_rekey(registry: Arc<Registry>, gref: GroupRef, trigger: RekeyTrigger) {
    let Some(gate) = registry.rekey_gate(gref) else {
        return;
    };
    let _guard = match trigger {
        RekeyTrigger::Admission => gate.lock().await,
        RekeyTrigger::Counter => match gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("rekey already in flight, skipping counter-driven round");
                return;
            }
        },
    };

    let request = match Envelope::pack(MsgKind::MakeNewKey, &MakeNewKeyRequest {})
        .and_then(|envelope| envelope.encode())
    {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "cannot encode rekey request");
            return;
        }
    };

    let mut participants = Vec::new();
    for target in registry.rekey_roster(gref) {
        target.slot.clear();
        if target
            .outbound
            .send(Message::Text(request.clone().into()))
            .await
            .is_err()
        {
            warn!(member = %target.id, "cannot request new key, evicting");
            registry.nuke(target.id);
            continue;
        }
        participants.push(target);
    }
    debug!(participants = participants.len(), "collecting short-term keys");

    let waits: Vec<_> = participants
        .into_iter()
        .map(|target| {
            let registry = registry.clone();
            async move {
                match target.slot.take(REKEY_DEADLINE).await {
                    Some(key) => {
                        registry.store_short_term(target.id, key);
                        Some(target.id)
                    }
                    None => {
                        warn!(member = %target.id, "no short-term key within deadline, evicting");
                        registry.nuke(target.id);
                        None
                    }
                }
            }
        })
        .collect();
    let completed: HashSet<MemberId> = waits.join().await.into_iter().flatten().collect();

    // Snapshot after the join: anyone evicted in the meantime is gone, and a
    // member admitted mid-round (not in `completed`) waits for the round its
    // own admission triggered.
    let keyed: Vec<_> = registry
        .peer_key_roster(gref)
        .into_iter()
        .filter(|target| completed.contains(&target.id))
        .filter_map(|target| target.short_term.map(|key| (target.id, key, target.outbound)))
        .collect();
    for (member_id, _, outbound) in &keyed {
        let keys = keyed
            .iter()
            .filter(|(other, ..)| other != member_id)
            .map(|(_, key, _)| *key)
            .collect();
        let raw = match Envelope::pack(MsgKind::NewPeerKeys, &NewPeerKeys { keys })
            .and_then(|envelope| envelope.encode())
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(member = %member_id, error = %err, "cannot encode peer key roster");
                continue;
            }
        };
        if outbound.send(Message::Text(raw.into())).await.is_err() {
            warn!(member = %member_id, "cannot deliver peer keys, evicting");
            registry.nuke(*member_id);
        }
    }
    debug!(members = keyed.len(), "rekey round complete");
}
