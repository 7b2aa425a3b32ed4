// FrameStore - last-frame-per-universe snapshot surface
//
// The engines write here as a side channel so observers (show recorders,
// monitors, HTTP status front-ends) can read merged output without
// touching engine state. Readers only ever see whole frames.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Frame storage for all universes
pub struct FrameStore {
    frames: RwLock<HashMap<u16, Vec<u8>>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            frames: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, universe: u16, data: &[u8]) {
        let mut frames = self.frames.write();
        frames.insert(universe, data.to_vec());
    }

    pub fn get(&self, universe: u16) -> Option<Vec<u8>> {
        let frames = self.frames.read();
        frames.get(&universe).cloned()
    }

    pub fn get_all(&self) -> HashMap<u16, Vec<u8>> {
        self.frames.read().clone()
    }

    pub fn clear(&self) {
        self.frames.write().clear();
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe frame store handle
pub type FrameStoreHandle = Arc<FrameStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_whole_frames_per_universe() {
        let store = FrameStore::new();
        store.update(1, &[1, 2, 3]);
        store.update(2, &[4, 5, 6]);
        store.update(1, &[7, 8, 9]);

        assert_eq!(store.get(1), Some(vec![7, 8, 9]));
        assert_eq!(store.get(2), Some(vec![4, 5, 6]));
        assert_eq!(store.get(3), None);
        assert_eq!(store.get_all().len(), 2);
    }
}
