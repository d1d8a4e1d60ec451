use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::time::{Duration, Instant, timeout_at};
use conclave_crypt::dh::DhPublic;

/// Single-slot mailbox carrying a member's next short-term public key from
/// its receive loop to the active rekey round.
///
/// Offers are send-if-empty: a reply arriving while no rekey is waiting (or
/// a duplicate reply) is discarded rather than blocking the receive loop.
pub struct KeySlot {
    value: Mutex<Option<DhPublic>>,
    notify: Notify,
}

impl KeySlot {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Store a key if the slot is empty. Returns false when the key was
    /// discarded.
    pub fn offer(&self, key: DhPublic) -> bool {
        let mut guard = self.value.lock().unwrap();
        if guard.is_some() {
            return false;
        }
        *guard = Some(key);
        drop(guard);
        self.notify.notify_one();
        true
    }

    /// Drop any stale key left over from an earlier round.
    pub fn clear(&self) {
        self.value.lock().unwrap().take();
    }

    /// Wait up to `deadline` for a key to arrive.
    pub async fn take(&self, deadline: Duration) -> Option<DhPublic> {
        let deadline = Instant::now() + deadline;
        loop {
            if let Some(key) = self.value.lock().unwrap().take() {
                return Some(key);
            }
            if timeout_at(deadline, self.notify.notified()).await.is_err() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Duration;
    use conclave_crypt::dh::DhSecret;

    use super::KeySlot;

    fn key(byte: u8) -> conclave_crypt::dh::DhPublic {
        DhSecret::from_bytes([byte; 32]).public_key()
    }

    #[tokio::test]
    async fn offer_then_take() {
        let slot = KeySlot::new();
        assert!(slot.offer(key(1)));
        let taken = slot.take(Duration::from_secs(1)).await.expect("taken");
        assert_eq!(taken.to_bytes(), key(1).to_bytes());
    }

    #[tokio::test]
    async fn second_offer_is_discarded() {
        let slot = KeySlot::new();
        assert!(slot.offer(key(1)));
        assert!(!slot.offer(key(2)));
        let taken = slot.take(Duration::from_secs(1)).await.expect("taken");
        assert_eq!(taken.to_bytes(), key(1).to_bytes());
    }

    #[tokio::test]
    async fn take_wakes_on_late_offer() {
        let slot = Arc::new(KeySlot::new());
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.take(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(slot.offer(key(3)));
        let taken = waiter.await.expect("join").expect("taken");
        assert_eq!(taken.to_bytes(), key(3).to_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn take_times_out_when_nothing_arrives() {
        let slot = KeySlot::new();
        assert!(slot.take(Duration::from_secs(3)).await.is_none());
    }

    #[tokio::test]
    async fn clear_discards_a_stale_key() {
        let slot = KeySlot::new();
        assert!(slot.offer(key(4)));
        slot.clear();
        assert!(slot.take(Duration::from_millis(10)).await.is_none());
    }
}
