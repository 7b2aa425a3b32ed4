// Two-source merge engine for one output port
//
// Each output port accepts at most two concurrent network sources, A and
// B. A source is identified by its sender IP (Art-Net) or IP + CID
// (sACN). A third distinct source is silently dropped. Sources that go
// quiet for MERGE_TIMEOUT are evicted on the next ingest.

use std::net::Ipv4Addr;

use crate::lightset::{MergeMode, UNIVERSE_SIZE};

/// Source silence after which its slot is evicted
pub const MERGE_TIMEOUT_MILLIS: u32 = 10_000;

/// One source slot
#[derive(Debug, Clone)]
pub struct Source {
    /// Sender IPv4; unspecified means the slot is empty
    pub ip: Ipv4Addr,
    /// Sender CID, all zero for Art-Net sources
    pub cid: [u8; 16],
    /// Last accepted sequence number
    pub sequence: u8,
    /// Timestamp of the last accepted frame
    pub last_millis: u32,
}

impl Source {
    fn new() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            cid: [0; 16],
            sequence: 0,
            last_millis: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ip.is_unspecified()
    }

    fn clear(&mut self) {
        self.ip = Ipv4Addr::UNSPECIFIED;
        self.cid = [0; 16];
    }
}

/// Which slot a source occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

/// Outcome of feeding one frame into the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// The frame was applied and the port has a single source
    Sole,
    /// The frame was applied as part of a two-source merge
    Merged,
    /// A third distinct source; the frame was dropped
    Dropped,
}

/// Per-port merge state: both source buffers, the merged output and the
/// slot bookkeeping. The three 512-byte buffers are kept together so a
/// port's working memory stays contiguous.
pub struct MergeEngine {
    source_a: Source,
    source_b: Source,
    data_a: [u8; UNIVERSE_SIZE],
    data_b: [u8; UNIVERSE_SIZE],
    merged: [u8; UNIVERSE_SIZE],
    length: u16,
    merge_mode: MergeMode,
    is_merging: bool,
}

impl MergeEngine {
    pub fn new(merge_mode: MergeMode) -> Self {
        Self {
            source_a: Source::new(),
            source_b: Source::new(),
            data_a: [0; UNIVERSE_SIZE],
            data_b: [0; UNIVERSE_SIZE],
            merged: [0; UNIVERSE_SIZE],
            length: 0,
            merge_mode,
            is_merging: false,
        }
    }

    pub fn merge_mode(&self) -> MergeMode {
        self.merge_mode
    }

    pub fn set_merge_mode(&mut self, merge_mode: MergeMode) {
        self.merge_mode = merge_mode;
    }

    pub fn is_merging(&self) -> bool {
        self.is_merging
    }

    /// The merged output frame
    pub fn merged(&self) -> &[u8] {
        &self.merged[..self.length as usize]
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn clear_length(&mut self) {
        self.length = 0;
    }

    /// Zero the merged buffer at full universe length (ArtAddress clear
    /// output command)
    pub fn clear_output(&mut self) {
        self.merged = [0; UNIVERSE_SIZE];
        self.length = UNIVERSE_SIZE as u16;
    }

    pub fn source(&self, slot: Slot) -> &Source {
        match slot {
            Slot::A => &self.source_a,
            Slot::B => &self.source_b,
        }
    }

    pub fn source_mut(&mut self, slot: Slot) -> &mut Source {
        match slot {
            Slot::A => &mut self.source_a,
            Slot::B => &mut self.source_b,
        }
    }

    pub fn active_sources(&self) -> usize {
        usize::from(!self.source_a.is_empty()) + usize::from(!self.source_b.is_empty())
    }

    /// Find the slot an identified sender occupies, if any. Art-Net
    /// callers pass `cid = None` and match by IP alone; sACN callers
    /// match IP + CID.
    pub fn slot_of(&self, ip: Ipv4Addr, cid: Option<&[u8; 16]>) -> Option<Slot> {
        let matches = |source: &Source| {
            !source.is_empty() && source.ip == ip && cid.map_or(true, |c| &source.cid == c)
        };

        if matches(&self.source_a) {
            Some(Slot::A)
        } else if matches(&self.source_b) {
            Some(Slot::B)
        } else {
            None
        }
    }

    /// Pre-fill a slot with the local IP so a local DMX input merges like
    /// a remote source. Slot A when free, else slot B.
    pub fn bind_local(&mut self, local_ip: Ipv4Addr) -> Slot {
        if self.source_a.is_empty() {
            self.source_a.ip = local_ip;
            Slot::A
        } else {
            self.source_b.ip = local_ip;
            Slot::B
        }
    }

    /// Feed one frame. Follows the seven-case decision table over the
    /// (slot A, slot B, sender) state.
    pub fn ingest(
        &mut self,
        ip: Ipv4Addr,
        cid: Option<[u8; 16]>,
        sequence: u8,
        data: &[u8],
        now_millis: u32,
    ) -> Ingest {
        let matched = self.slot_of(ip, cid.as_ref());
        let a_empty = self.source_a.is_empty();
        let b_empty = self.source_b.is_empty();

        let (slot, merging) = match (matched, a_empty, b_empty) {
            // 1. first packet on this port
            (None, true, true) => (Slot::A, false),
            // 2./3. continued transmission from the known source
            (Some(Slot::A), _, true) => (Slot::A, false),
            (Some(Slot::B), true, _) => (Slot::B, false),
            // 4./5. a second source appears, start the merge
            (None, false, true) => (Slot::B, true),
            (None, true, false) => (Slot::A, true),
            // 6./7. continue the merge
            (Some(slot), _, _) => (slot, true),
            // more than two sources
            (None, false, false) => return Ingest::Dropped,
        };

        {
            let source = self.source_mut(slot);
            source.ip = ip;
            if let Some(cid) = cid {
                source.cid = cid;
            }
            source.sequence = sequence;
            source.last_millis = now_millis;
        }

        if merging {
            self.is_merging = true;
        }

        self.apply(slot, data);

        if merging {
            Ingest::Merged
        } else {
            Ingest::Sole
        }
    }

    fn apply(&mut self, slot: Slot, data: &[u8]) {
        let length = data.len().min(UNIVERSE_SIZE);

        match slot {
            Slot::A => self.data_a[..length].copy_from_slice(&data[..length]),
            Slot::B => self.data_b[..length].copy_from_slice(&data[..length]),
        }
        self.length = length as u16;

        if self.is_merging && self.merge_mode == MergeMode::Htp {
            for i in 0..length {
                self.merged[i] = self.data_a[i].max(self.data_b[i]);
            }
        } else {
            // LTP, or a single source: the latest frame is the output
            self.merged[..length].copy_from_slice(&data[..length]);
        }
    }

    /// Evict sources that have been silent longer than the merge timeout.
    /// Returns true when an eviction happened.
    pub fn sweep(&mut self, now_millis: u32) -> bool {
        let mut evicted = false;

        if !self.source_a.is_empty()
            && now_millis.wrapping_sub(self.source_a.last_millis) > MERGE_TIMEOUT_MILLIS
        {
            self.source_a.clear();
            self.is_merging = false;
            evicted = true;
        }

        if !self.source_b.is_empty()
            && now_millis.wrapping_sub(self.source_b.last_millis) > MERGE_TIMEOUT_MILLIS
        {
            self.source_b.clear();
            self.is_merging = false;
            evicted = true;
        }

        evicted
    }

    /// Drop one slot (sACN stream terminated, priority preemption)
    pub fn evict(&mut self, slot: Slot) {
        self.source_mut(slot).clear();
        self.is_merging = false;
    }

    /// Drop both slots (ArtAddress cancel-merge, network data loss)
    pub fn cancel(&mut self) {
        self.source_a.clear();
        self.source_b.clear();
        self.is_merging = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);
    const IP_C: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 4);

    #[test]
    fn first_source_fills_slot_a_and_passes_through() {
        let mut engine = MergeEngine::new(MergeMode::Htp);
        let frame: Vec<u8> = (0..=255).cycle().take(512).collect();

        assert_eq!(engine.ingest(IP_A, None, 1, &frame, 0), Ingest::Sole);
        assert_eq!(engine.merged(), &frame[..]);
        assert_eq!(engine.source(Slot::A).ip, IP_A);
        assert!(engine.source(Slot::B).is_empty());
        assert!(!engine.is_merging());
    }

    #[test]
    fn second_source_starts_an_htp_merge() {
        let mut engine = MergeEngine::new(MergeMode::Htp);
        let frame_a = [0x10, 0x20, 0x30, 0x10, 0x20, 0x30, 0x10, 0x20, 0x30, 0x10, 0x20, 0x30, 0x10, 0x20, 0x30, 0x10];
        let frame_b = [0x30, 0x10, 0x20, 0x30, 0x10, 0x20, 0x30, 0x10, 0x20, 0x30, 0x10, 0x20, 0x30, 0x10, 0x20, 0x30];

        assert_eq!(engine.ingest(IP_A, None, 1, &frame_a, 0), Ingest::Sole);
        assert_eq!(engine.ingest(IP_B, None, 1, &frame_b, 5), Ingest::Merged);

        assert!(engine.is_merging());
        let expected: Vec<u8> = frame_a.iter().zip(frame_b.iter()).map(|(a, b)| *a.max(b)).collect();
        assert_eq!(engine.merged(), &expected[..]);
    }

    #[test]
    fn htp_merge_is_commutative() {
        let frame_a: Vec<u8> = (0..64).map(|i| (i * 3) as u8).collect();
        let frame_b: Vec<u8> = (0..64).map(|i| (200 - i) as u8).collect();

        let mut forward = MergeEngine::new(MergeMode::Htp);
        forward.ingest(IP_A, None, 1, &frame_a, 0);
        forward.ingest(IP_B, None, 1, &frame_b, 1);

        let mut reverse = MergeEngine::new(MergeMode::Htp);
        reverse.ingest(IP_B, None, 1, &frame_b, 0);
        reverse.ingest(IP_A, None, 1, &frame_a, 1);

        assert_eq!(forward.merged(), reverse.merged());
    }

    #[test]
    fn ltp_merge_tracks_the_latest_frame() {
        let mut engine = MergeEngine::new(MergeMode::Ltp);
        let frame_a = [0x80u8; 16];
        let frame_b = [0x01u8; 16];

        engine.ingest(IP_A, None, 1, &frame_a, 0);
        engine.ingest(IP_B, None, 1, &frame_b, 5);
        assert_eq!(engine.merged(), &frame_b[..]);

        engine.ingest(IP_A, None, 2, &frame_a, 10);
        assert_eq!(engine.merged(), &frame_a[..]);
    }

    #[test]
    fn a_third_source_is_dropped() {
        let mut engine = MergeEngine::new(MergeMode::Htp);
        engine.ingest(IP_A, None, 1, &[1; 16], 0);
        engine.ingest(IP_B, None, 1, &[2; 16], 1);

        assert_eq!(engine.ingest(IP_C, None, 1, &[0xff; 16], 2), Ingest::Dropped);
        assert_eq!(engine.slot_of(IP_C, None), None);
        assert!(engine.merged().iter().all(|&v| v <= 2));
    }

    #[test]
    fn sacn_sources_need_matching_cids() {
        let mut engine = MergeEngine::new(MergeMode::Htp);
        let cid_1 = [1u8; 16];
        let cid_2 = [2u8; 16];

        engine.ingest(IP_A, Some(cid_1), 1, &[1; 16], 0);
        assert_eq!(engine.slot_of(IP_A, Some(&cid_1)), Some(Slot::A));
        // Same IP, different CID is a different source
        assert_eq!(engine.slot_of(IP_A, Some(&cid_2)), None);

        engine.ingest(IP_A, Some(cid_2), 1, &[2; 16], 1);
        assert_eq!(engine.slot_of(IP_A, Some(&cid_2)), Some(Slot::B));
        assert!(engine.is_merging());
    }

    #[test]
    fn silent_sources_are_evicted_after_the_merge_timeout() {
        let mut engine = MergeEngine::new(MergeMode::Htp);
        engine.ingest(IP_A, None, 1, &[1; 16], 0);
        engine.ingest(IP_B, None, 1, &[2; 16], 8_000);

        // A went quiet at t=0; B keeps talking
        assert!(engine.sweep(MERGE_TIMEOUT_MILLIS + 1));
        assert!(engine.source(Slot::A).is_empty());
        assert_eq!(engine.slot_of(IP_B, None), Some(Slot::B));
        assert!(!engine.is_merging());
    }

    #[test]
    fn sweep_within_the_timeout_is_a_no_op() {
        let mut engine = MergeEngine::new(MergeMode::Htp);
        engine.ingest(IP_A, None, 1, &[1; 16], 0);
        assert!(!engine.sweep(MERGE_TIMEOUT_MILLIS));
        assert_eq!(engine.slot_of(IP_A, None), Some(Slot::A));
    }

    #[test]
    fn cancel_empties_both_slots() {
        let mut engine = MergeEngine::new(MergeMode::Htp);
        engine.ingest(IP_A, None, 1, &[1; 16], 0);
        engine.ingest(IP_B, None, 1, &[2; 16], 1);

        engine.cancel();
        assert_eq!(engine.active_sources(), 0);
        assert!(!engine.is_merging());
    }

    #[test]
    fn local_binding_prefers_slot_a() {
        let mut engine = MergeEngine::new(MergeMode::Htp);
        let local = Ipv4Addr::new(192, 168, 1, 10);

        assert_eq!(engine.bind_local(local), Slot::A);
        // A remote source then lands in slot B and merges
        assert_eq!(engine.ingest(IP_A, None, 1, &[9; 8], 0), Ingest::Merged);
    }
}
