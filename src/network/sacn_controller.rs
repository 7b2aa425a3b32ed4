// sACN E1.31 sender
//
// Emits Data packets to the per-universe multicast groups, an optional
// Synchronization packet after each burst, and periodic Universe
// Discovery pages for everything it originates.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::host::Host;
use crate::lightset::DMX_MAX_VALUE;
use crate::network::sacn;
use crate::network::socket;

/// Bounded set of universes this controller originates
const MAX_ACTIVE_UNIVERSES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    StandBy,
    On,
    Off,
}

/// Sender configuration
#[derive(Debug, Clone)]
pub struct SacnControllerConfig {
    pub source_name: String,
    pub bind_address: Ipv4Addr,
    /// Framing-layer priority for everything we send
    pub priority: u8,
    /// Master attenuator, 255 = full through
    pub master: u8,
    /// Synchronization universe; 0 disables synchronization
    pub synchronization_universe: u16,
}

impl Default for SacnControllerConfig {
    fn default() -> Self {
        Self {
            source_name: "lxnode sACN controller".into(),
            bind_address: Ipv4Addr::UNSPECIFIED,
            priority: sacn::priority::DEFAULT,
            master: DMX_MAX_VALUE,
            synchronization_universe: 0,
        }
    }
}

struct ActiveUniverse {
    universe: u16,
    sequence: u8,
    multicast_ip: Ipv4Addr,
}

/// The sACN sender engine
pub struct SacnController {
    host: Box<dyn Host + Send>,

    status: Status,
    source_name: String,
    cid: [u8; 16],
    priority: u8,
    master: u8,
    bind_address: Ipv4Addr,

    sync_universe: u16,
    sync_sequence: u8,
    dmx_handled: bool,

    universes: Vec<ActiveUniverse>,
    discovery_millis: u32,

    outbound: VecDeque<(Vec<u8>, SocketAddrV4)>,
    socket: Option<Arc<UdpSocket>>,
}

impl SacnController {
    pub fn new(config: SacnControllerConfig, host: Box<dyn Host + Send>) -> Self {
        let cid = host.cid();
        Self {
            host,
            status: Status::StandBy,
            source_name: config.source_name,
            cid,
            priority: config.priority,
            master: config.master,
            bind_address: config.bind_address,
            sync_universe: config.synchronization_universe,
            sync_sequence: 0,
            dmx_handled: false,
            universes: Vec::new(),
            discovery_millis: 0,
            outbound: VecDeque::new(),
            socket: None,
        }
    }

    pub fn set_master(&mut self, master: u8) {
        self.master = master;
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority.min(sacn::priority::HIGHEST);
    }

    /// Bind 5568 and go to `On`.
    pub async fn start(&mut self) -> Result<()> {
        let udp = socket::bind(self.bind_address, sacn::SACN_PORT)?;
        self.socket = Some(Arc::new(udp));
        self.status = Status::On;
        log::info!("sACN controller up on {}:{}", self.bind_address, sacn::SACN_PORT);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.status = Status::Off;
        log::info!("sACN controller stopped");
    }

    /// The cooperative loop; this engine only transmits.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = self.socket.clone().ok_or(Error::NotRunning)?;
        let mut ticker = tokio::time::interval(Duration::from_millis(25));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            self.flush_outbound(&socket).await;

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        self.stop();
        self.flush_outbound(&socket).await;
        Ok(())
    }

    async fn flush_outbound(&mut self, socket: &UdpSocket) {
        while let Some((data, target)) = self.outbound.pop_front() {
            if let Err(error) = socket.send_to(&data, target).await {
                log::warn!("sACN send to {} failed: {}", target, error);
            }
        }
    }

    /// Drive the discovery timer.
    pub fn tick(&mut self) {
        if self.status != Status::On {
            return;
        }

        let now = self.host.now_millis();
        if now.wrapping_sub(self.discovery_millis) >= sacn::UNIVERSE_DISCOVERY_INTERVAL_MILLIS {
            self.discovery_millis = now;
            self.send_discovery();
        }
    }

    /// Send one universe of DMX to its multicast group. Returns false
    /// when the universe table is full and the frame was dropped.
    pub fn handle_dmx_out(&mut self, universe: u16, data: &[u8]) -> bool {
        if self.status != Status::On || universe == 0 || universe > sacn::UNIVERSE_MAX {
            return false;
        }

        let (sequence, multicast_ip) = match self.next_sequence(universe) {
            Some(entry) => entry,
            None => return false,
        };

        let mut frame = data[..data.len().min(512)].to_vec();
        self.apply_master(&mut frame);

        let packet = sacn::DataPacket {
            cid: self.cid,
            source_name: self.source_name.clone(),
            priority: self.priority,
            synchronization_address: self.sync_universe,
            sequence,
            options: 0,
            universe,
            start_code: 0,
            data: frame,
        };

        self.outbound
            .push_back((packet.to_bytes(), SocketAddrV4::new(multicast_ip, sacn::SACN_PORT)));
        self.dmx_handled = true;
        true
    }

    /// Send the Synchronization packet that releases the preceding burst.
    pub fn handle_sync(&mut self) {
        if self.sync_universe == 0 || !self.dmx_handled {
            return;
        }
        self.dmx_handled = false;

        self.sync_sequence = self.sync_sequence.wrapping_add(1);
        let packet = sacn::SyncPacket {
            cid: self.cid,
            sequence: self.sync_sequence,
            synchronization_address: self.sync_universe,
        };

        self.outbound
            .push_back((packet.to_bytes(), sacn::multicast_target(self.sync_universe)));
    }

    /// Zero every universe this controller has been driving.
    pub fn blackout(&mut self) {
        let universes: Vec<u16> = self.universes.iter().map(|entry| entry.universe).collect();
        for universe in universes {
            self.handle_dmx_out(universe, &[0u8; 512]);
        }
        self.handle_sync();
    }

    fn send_discovery(&mut self) {
        if self.universes.is_empty() {
            return;
        }

        let all: Vec<u16> = self.universes.iter().map(|entry| entry.universe).collect();
        let pages: Vec<&[u16]> = all.chunks(sacn::DISCOVERY_PAGE_SIZE).collect();
        let last_page = (pages.len() - 1) as u8;

        for (page, universes) in pages.into_iter().enumerate() {
            let packet = sacn::DiscoveryPacket {
                cid: self.cid,
                source_name: self.source_name.clone(),
                page: page as u8,
                last_page,
                universes: universes.to_vec(),
            };
            self.outbound.push_back((
                packet.to_bytes(),
                sacn::multicast_target(sacn::DISCOVERY_UNIVERSE),
            ));
        }
    }

    fn next_sequence(&mut self, universe: u16) -> Option<(u8, Ipv4Addr)> {
        match self
            .universes
            .binary_search_by_key(&universe, |entry| entry.universe)
        {
            Ok(index) => {
                let entry = &mut self.universes[index];
                entry.sequence = if entry.sequence == 255 { 1 } else { entry.sequence + 1 };
                Some((entry.sequence, entry.multicast_ip))
            }
            Err(insert_at) => {
                if self.universes.len() == MAX_ACTIVE_UNIVERSES {
                    return None;
                }
                let multicast_ip = sacn::multicast_ip(universe);
                self.universes.insert(
                    insert_at,
                    ActiveUniverse { universe, sequence: 1, multicast_ip },
                );
                Some((1, multicast_ip))
            }
        }
    }

    fn apply_master(&mut self, data: &mut [u8]) {
        if self.master == DMX_MAX_VALUE {
            return;
        }
        if self.master == 0 {
            data.fill(0);
            return;
        }
        for value in data.iter_mut() {
            *value = ((self.master as u16 * *value as u16) / DMX_MAX_VALUE as u16) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::sacn::SacnPacket;
    use crate::network::testutil::{FakeHost, SharedHost};

    fn sender(config: SacnControllerConfig) -> (SacnController, Arc<FakeHost>) {
        let host = Arc::new(FakeHost::new());
        let mut controller = SacnController::new(config, Box::new(SharedHost(host.clone())));
        controller.status = Status::On;
        (controller, host)
    }

    fn drain(controller: &mut SacnController) -> Vec<(SacnPacket, SocketAddrV4)> {
        let mut packets = Vec::new();
        while let Some((data, target)) = controller.outbound.pop_front() {
            packets.push((sacn::classify(&data).unwrap(), target));
        }
        packets
    }

    #[test]
    fn data_goes_to_the_universe_multicast_group() {
        let (mut controller, _host) = sender(SacnControllerConfig::default());

        assert!(controller.handle_dmx_out(700, &[0x10u8; 512]));

        let packets = drain(&mut controller);
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            (SacnPacket::Data(packet), target) => {
                assert_eq!(packet.universe, 700);
                assert_eq!(packet.priority, sacn::priority::DEFAULT);
                assert_eq!(*target.ip(), Ipv4Addr::new(239, 255, 2, 188));
                assert_eq!(target.port(), sacn::SACN_PORT);
            }
            other => panic!("expected Data, got {:?}", other),
        }
    }

    #[test]
    fn per_universe_sequences_cycle_without_zero() {
        let (mut controller, _host) = sender(SacnControllerConfig::default());

        for _ in 0..300 {
            controller.handle_dmx_out(1, &[0u8; 16]);
        }
        // An interleaved universe keeps its own counter
        controller.handle_dmx_out(2, &[0u8; 16]);

        let mut universe_1 = Vec::new();
        let mut universe_2 = Vec::new();
        for (packet, _) in drain(&mut controller) {
            if let SacnPacket::Data(packet) = packet {
                match packet.universe {
                    1 => universe_1.push(packet.sequence),
                    2 => universe_2.push(packet.sequence),
                    _ => {}
                }
            }
        }

        assert_eq!(universe_1.len(), 300);
        assert!(universe_1.iter().all(|&s| s != 0));
        assert_eq!(universe_1[254], 255);
        assert_eq!(universe_1[255], 1);
        assert_eq!(universe_2, vec![1]);
    }

    #[test]
    fn invalid_universes_are_rejected() {
        let (mut controller, _host) = sender(SacnControllerConfig::default());
        assert!(!controller.handle_dmx_out(0, &[0u8; 16]));
        assert!(!controller.handle_dmx_out(sacn::UNIVERSE_MAX + 1, &[0u8; 16]));
    }

    #[test]
    fn synchronization_packet_follows_the_burst() {
        let (mut controller, _host) = sender(SacnControllerConfig {
            synchronization_universe: 7999,
            ..SacnControllerConfig::default()
        });

        controller.handle_dmx_out(1, &[0u8; 16]);
        controller.handle_dmx_out(2, &[0u8; 16]);
        controller.handle_sync();
        controller.handle_sync(); // nothing new to release

        let packets = drain(&mut controller);
        assert_eq!(packets.len(), 3);

        match &packets[0].0 {
            SacnPacket::Data(packet) => assert_eq!(packet.synchronization_address, 7999),
            other => panic!("expected Data, got {:?}", other),
        }
        match &packets[2] {
            (SacnPacket::Sync(sync), target) => {
                assert_eq!(sync.synchronization_address, 7999);
                assert_eq!(*target.ip(), sacn::multicast_ip(7999));
            }
            other => panic!("expected Sync, got {:?}", other),
        }
    }

    #[test]
    fn master_attenuator_scales_levels() {
        let (mut controller, _host) = sender(SacnControllerConfig {
            master: 128,
            ..SacnControllerConfig::default()
        });

        controller.handle_dmx_out(1, &[0xff, 0x80, 0x00]);
        match drain(&mut controller).remove(0).0 {
            SacnPacket::Data(packet) => assert_eq!(&packet.data[..3], &[128, 64, 0]),
            other => panic!("expected Data, got {:?}", other),
        }
    }

    #[test]
    fn discovery_lists_every_active_universe() {
        let (mut controller, host) = sender(SacnControllerConfig::default());

        controller.handle_dmx_out(3, &[0u8; 16]);
        controller.handle_dmx_out(1, &[0u8; 16]);
        controller.handle_dmx_out(2, &[0u8; 16]);
        drain(&mut controller);

        host.advance(sacn::UNIVERSE_DISCOVERY_INTERVAL_MILLIS + 1);
        controller.tick();

        let packets = drain(&mut controller);
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            (SacnPacket::Discovery(discovery), target) => {
                // Sorted because the universe table is sorted
                assert_eq!(discovery.universes, vec![1, 2, 3]);
                assert_eq!(discovery.page, 0);
                assert_eq!(discovery.last_page, 0);
                assert_eq!(*target.ip(), Ipv4Addr::new(239, 255, 250, 214));
            }
            other => panic!("expected Discovery, got {:?}", other),
        }
    }

    #[test]
    fn discovery_pages_when_more_than_512_universes_are_active() {
        let (mut controller, host) = sender(SacnControllerConfig::default());

        for universe in 1..=600u16 {
            controller.universes.push(ActiveUniverse {
                universe,
                sequence: 0,
                multicast_ip: sacn::multicast_ip(universe),
            });
        }

        host.advance(sacn::UNIVERSE_DISCOVERY_INTERVAL_MILLIS + 1);
        controller.tick();

        let packets = drain(&mut controller);
        assert_eq!(packets.len(), 2);
        match (&packets[0].0, &packets[1].0) {
            (SacnPacket::Discovery(first), SacnPacket::Discovery(second)) => {
                assert_eq!(first.page, 0);
                assert_eq!(first.last_page, 1);
                assert_eq!(first.universes.len(), 512);
                assert_eq!(second.page, 1);
                assert_eq!(second.last_page, 1);
                assert_eq!(second.universes.len(), 88);
            }
            other => panic!("expected two Discovery pages, got {:?}", other),
        }
    }

    #[test]
    fn blackout_zeroes_every_universe_it_drove() {
        let (mut controller, _host) = sender(SacnControllerConfig::default());

        controller.handle_dmx_out(1, &[0x40u8; 16]);
        controller.handle_dmx_out(2, &[0x40u8; 16]);
        drain(&mut controller);

        controller.blackout();
        let packets = drain(&mut controller);
        assert_eq!(packets.len(), 2);
        for (packet, _) in packets {
            match packet {
                SacnPacket::Data(packet) => assert!(packet.data.iter().all(|&v| v == 0)),
                other => panic!("expected Data, got {:?}", other),
            }
        }
    }
}
