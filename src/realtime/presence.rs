use std::{collections::HashMap, sync::Mutex};

use uuid::Uuid;

/// Reference-counted presence. A user with several tabs open stays online
/// until the last connection drops; a boolean flag would flap.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    counts: Mutex<HashMap<Uuid, usize>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly when the user crossed offline → online.
    pub fn connect(&self, user_id: Uuid) -> bool {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(user_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true exactly when the user crossed online → offline.
    /// A decrement without a matching connect is ignored, counts never go
    /// negative.
    pub fn disconnect(&self, user_id: Uuid) -> bool {
        let mut counts = self.counts.lock().unwrap();
        match counts.get_mut(&user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(&user_id);
                true
            }
            None => {
                tracing::warn!(%user_id, "presence disconnect without a matching connect");
                false
            }
        }
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.counts.lock().unwrap().contains_key(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_connection_cycle() {
        let presence = PresenceRegistry::new();
        let user = Uuid::now_v7();

        assert!(!presence.is_online(user));
        assert!(presence.connect(user));
        assert!(presence.is_online(user));
        assert!(presence.disconnect(user));
        assert!(!presence.is_online(user));
    }

    #[test]
    fn second_tab_does_not_flap() {
        let presence = PresenceRegistry::new();
        let user = Uuid::now_v7();

        assert!(presence.connect(user));
        assert!(!presence.connect(user));

        // Closing one tab keeps the user online.
        assert!(!presence.disconnect(user));
        assert!(presence.is_online(user));

        // Closing the last one emits exactly one offline edge.
        assert!(presence.disconnect(user));
        assert!(!presence.is_online(user));
    }

    #[test]
    fn spurious_disconnect_is_ignored() {
        let presence = PresenceRegistry::new();
        let user = Uuid::now_v7();

        assert!(!presence.disconnect(user));
        assert!(presence.connect(user));
        assert!(presence.is_online(user));
    }
}
