use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use conclave_crypt::dh::DhPublic;
use conclave_crypt::ecies::EciesPublic;
use conclave_structs::{GroupId, MemberId};

use crate::slot::KeySlot;

/// Number of relayed text messages between counter-driven rekeys.
pub const ROTATE_KEYS_EVERY: u8 = 8;

/// Per-connection state tracked by the registry.
pub struct Member {
    pub id: MemberId,
    pub long_term: EciesPublic,
    pub short_term: Option<DhPublic>,
    pub pending: Arc<KeySlot>,
    pub outbound: mpsc::Sender<Message>,
}

struct Group {
    access_key: GroupId,
    members: Vec<Member>,
    counter: u8,
    rekey_gate: Arc<tokio::sync::Mutex<()>>,
}

/// Stable handle to a group, valid across access-key rotations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupRef(u64);

#[derive(Default)]
struct Inner {
    groups: HashMap<u64, Group>,
    by_key: HashMap<GroupId, u64>,
    next_ref: u64,
}

/// Target snapshot for access-key distribution.
pub struct RotateTarget {
    pub id: MemberId,
    pub long_term: EciesPublic,
    pub outbound: mpsc::Sender<Message>,
}

/// Target snapshot for the collect phase of a rekey.
pub struct RekeyTarget {
    pub id: MemberId,
    pub slot: Arc<KeySlot>,
    pub outbound: mpsc::Sender<Message>,
}

/// Target snapshot for the publish phase of a rekey, in roster order.
pub struct PeerKeyTarget {
    pub id: MemberId,
    pub short_term: Option<DhPublic>,
    pub outbound: mpsc::Sender<Message>,
}

/// All live groups and their rosters, guarded by one process-wide mutex.
///
/// Every roster and access-key mutation goes through these methods; outbound
/// traffic is sent through cloned channel handles with the lock released.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Mint a new empty group. Its initial access key is provisional and is
    /// rotated before anyone learns it.
    pub fn create_group(&self) -> (GroupRef, GroupId) {
        let access_key = GroupId::random();
        let mut inner = self.inner.lock().unwrap();
        let gref = inner.next_ref;
        inner.next_ref += 1;
        inner.groups.insert(
            gref,
            Group {
                access_key,
                members: Vec::new(),
                counter: 0,
                rekey_gate: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        inner.by_key.insert(access_key, gref);
        tracing::debug!(group = %access_key, "group created");
        (GroupRef(gref), access_key)
    }

    /// Look up a group by its current access key.
    pub fn authenticate(&self, key: &GroupId) -> Option<GroupRef> {
        let inner = self.inner.lock().unwrap();
        inner.by_key.get(key).copied().map(GroupRef)
    }

    /// Append a member to the group's roster. Returns false when the group
    /// has been torn down in the meantime.
    pub fn add_member(&self, gref: GroupRef, member: Member) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(group) = inner.groups.get_mut(&gref.0) else {
            return false;
        };
        group.members.push(member);
        true
    }

    /// Swap in a fresh access key, atomically with respect to `authenticate`,
    /// and snapshot the roster for key distribution.
    pub fn rotate_access_key(&self, gref: GroupRef) -> Option<(GroupId, Vec<RotateTarget>)> {
        let new_key = GroupId::random();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let group = inner.groups.get_mut(&gref.0)?;
        let old_key = group.access_key;
        group.access_key = new_key;
        let targets = group
            .members
            .iter()
            .map(|member| RotateTarget {
                id: member.id,
                long_term: member.long_term.clone(),
                outbound: member.outbound.clone(),
            })
            .collect();
        inner.by_key.remove(&old_key);
        inner.by_key.insert(new_key, gref.0);
        Some((new_key, targets))
    }

    /// The gate serializing rekey rounds on this group.
    pub fn rekey_gate(&self, gref: GroupRef) -> Option<Arc<tokio::sync::Mutex<()>>> {
        let inner = self.inner.lock().unwrap();
        inner.groups.get(&gref.0).map(|g| g.rekey_gate.clone())
    }

    /// Snapshot the roster for the request/collect phase of a rekey.
    pub fn rekey_roster(&self, gref: GroupRef) -> Vec<RekeyTarget> {
        let inner = self.inner.lock().unwrap();
        let Some(group) = inner.groups.get(&gref.0) else {
            return Vec::new();
        };
        group
            .members
            .iter()
            .map(|member| RekeyTarget {
                id: member.id,
                slot: member.pending.clone(),
                outbound: member.outbound.clone(),
            })
            .collect()
    }

    /// Record the short-term public key a member returned during a rekey.
    pub fn store_short_term(&self, member_id: MemberId, key: DhPublic) {
        let mut inner = self.inner.lock().unwrap();
        for group in inner.groups.values_mut() {
            if let Some(member) = group.members.iter_mut().find(|m| m.id == member_id) {
                member.short_term = Some(key);
                return;
            }
        }
    }

    /// Hand an incoming short-term key to the member's pending slot. Returns
    /// false when the member is gone or the slot already holds a key.
    pub fn offer_pending(&self, member_id: MemberId, key: DhPublic) -> bool {
        let slot = {
            let inner = self.inner.lock().unwrap();
            inner
                .groups
                .values()
                .flat_map(|g| g.members.iter())
                .find(|m| m.id == member_id)
                .map(|m| m.pending.clone())
        };
        match slot {
            Some(slot) => slot.offer(key),
            None => false,
        }
    }

    /// Snapshot the roster for the publish phase of a rekey, in roster order.
    pub fn peer_key_roster(&self, gref: GroupRef) -> Vec<PeerKeyTarget> {
        let inner = self.inner.lock().unwrap();
        let Some(group) = inner.groups.get(&gref.0) else {
            return Vec::new();
        };
        group
            .members
            .iter()
            .map(|member| PeerKeyTarget {
                id: member.id,
                short_term: member.short_term,
                outbound: member.outbound.clone(),
            })
            .collect()
    }

    /// Every other member of the sender's group, for message fan-out.
    pub fn peers_of(&self, member_id: MemberId) -> Vec<(MemberId, mpsc::Sender<Message>)> {
        let inner = self.inner.lock().unwrap();
        for group in inner.groups.values() {
            if group.members.iter().any(|m| m.id == member_id) {
                return group
                    .members
                    .iter()
                    .filter(|m| m.id != member_id)
                    .map(|m| (m.id, m.outbound.clone()))
                    .collect();
            }
        }
        Vec::new()
    }

    /// Count a relayed message against the group's rekey cadence. Returns the
    /// group handle when a counter-driven rekey is due.
    pub fn bump_counter(&self, member_id: MemberId) -> Option<GroupRef> {
        let mut inner = self.inner.lock().unwrap();
        for (gref, group) in inner.groups.iter_mut() {
            if group.members.iter().any(|m| m.id == member_id) {
                group.counter += 1;
                if group.counter >= ROTATE_KEYS_EVERY {
                    group.counter = 0;
                    return Some(GroupRef(*gref));
                }
                return None;
            }
        }
        None
    }

    /// Evict a member; tears the group down when it was the last one.
    ///
    /// Idempotent: evicting an already-removed member is a no-op. The close
    /// frame is pushed to the member's writer with the lock released.
    pub fn nuke(&self, member_id: MemberId) {
        let outbound = {
            let mut inner = self.inner.lock().unwrap();
            let Some(gref) = inner.groups.iter().find_map(|(gref, group)| {
                group
                    .members
                    .iter()
                    .any(|m| m.id == member_id)
                    .then_some(*gref)
            }) else {
                tracing::debug!(member = %member_id, "nuke: member already gone");
                return;
            };
            let mut emptied = None;
            let mut outbound = None;
            if let Some(group) = inner.groups.get_mut(&gref) {
                if let Some(pos) = group.members.iter().position(|m| m.id == member_id) {
                    outbound = Some(group.members.remove(pos).outbound);
                }
                if group.members.is_empty() {
                    emptied = Some(group.access_key);
                }
            }
            if let Some(key) = emptied {
                inner.groups.remove(&gref);
                inner.by_key.remove(&key);
                tracing::debug!(group = %key, "group torn down with its last member");
            }
            outbound
        };
        tracing::debug!(member = %member_id, "member evicted");
        if let Some(outbound) = outbound {
            let _ = outbound.try_send(Message::Close(None));
        }
    }

    #[cfg(test)]
    pub fn group_count(&self) -> usize {
        self.inner.lock().unwrap().groups.len()
    }

    #[cfg(test)]
    pub fn member_count(&self, gref: GroupRef) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .groups
            .get(&gref.0)
            .map(|g| g.members.len())
            .unwrap_or(0)
    }
}
