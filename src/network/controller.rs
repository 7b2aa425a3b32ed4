// Art-Net controller: discovery driver and DMX dispatcher
//
// Broadcasts ArtPoll every 8 s, folds the replies into the poll table
// and sends ArtDmx either unicast to the subscribers of a universe or
// broadcast when the subscriber count makes unicast pointless.

use serde::Serialize;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::host::{Host, TriggerSink};
use crate::lightset::DMX_MAX_VALUE;
use crate::network::artnet::{self, ArtPacket};
use crate::network::poll_table::PollTable;
use crate::network::socket;

/// Above this many subscribers a universe is broadcast instead of
/// unicast to each of them
const UNICAST_LIMIT: usize = 40;

/// Bounded set of universes this controller originates
const MAX_ACTIVE_UNIVERSES: usize = 512;

/// The poll table is cleaned incrementally every quarter poll interval
const CLEAN_INTERVAL_MILLIS: u32 = artnet::POLL_INTERVAL_MILLIS / 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    StandBy,
    On,
    Off,
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ArtControllerConfig {
    pub short_name: String,
    pub long_name: String,
    pub oem: u16,
    pub esta: u16,
    pub bind_address: Ipv4Addr,
    /// Unicast to poll-table subscribers when possible
    pub unicast: bool,
    /// Always broadcast, even when subscribers are known
    pub force_broadcast: bool,
    /// Send ArtSync after each burst of ArtDmx
    pub synchronization: bool,
    /// Master attenuator, 255 = full through
    pub master: u8,
}

impl Default for ArtControllerConfig {
    fn default() -> Self {
        Self {
            short_name: "lxnode ctl".into(),
            long_name: "lxnode Art-Net 4 controller".into(),
            oem: 0x00ff,
            esta: 0x7ff0,
            bind_address: Ipv4Addr::UNSPECIFIED,
            unicast: true,
            force_broadcast: false,
            synchronization: false,
            master: DMX_MAX_VALUE,
        }
    }
}

struct ActiveUniverse {
    universe: u16,
    sequence: u8,
}

/// The Art-Net controller engine
pub struct ArtController {
    host: Box<dyn Host + Send>,
    trigger: Option<Box<dyn TriggerSink + Send>>,

    status: Status,
    short_name: String,
    long_name: String,
    oem: u16,
    esta: u16,
    bind_address: Ipv4Addr,
    unicast: bool,
    force_broadcast: bool,
    synchronization: bool,
    master: u8,

    poll_table: PollTable,
    active_universes: Vec<ActiveUniverse>,
    dmx_handled: bool,
    poll_reply_count: u32,
    last_poll_millis: u32,
    last_clean_millis: u32,

    outbound: VecDeque<(Vec<u8>, SocketAddrV4)>,
    socket: Option<Arc<UdpSocket>>,
}

impl ArtController {
    pub fn new(config: ArtControllerConfig, host: Box<dyn Host + Send>) -> Self {
        Self {
            host,
            trigger: None,
            status: Status::StandBy,
            short_name: config.short_name,
            long_name: config.long_name,
            oem: config.oem,
            esta: config.esta,
            bind_address: config.bind_address,
            unicast: config.unicast,
            force_broadcast: config.force_broadcast,
            synchronization: config.synchronization,
            master: config.master,
            poll_table: PollTable::new(),
            active_universes: Vec::new(),
            dmx_handled: false,
            poll_reply_count: 0,
            last_poll_millis: 0,
            last_clean_millis: 0,
            outbound: VecDeque::new(),
            socket: None,
        }
    }

    pub fn set_trigger_sink(&mut self, trigger: Box<dyn TriggerSink + Send>) {
        self.trigger = Some(trigger);
    }

    pub fn set_master(&mut self, master: u8) {
        self.master = master;
    }

    pub fn poll_table(&self) -> &PollTable {
        &self.poll_table
    }

    pub fn poll_table_json(&self) -> serde_json::Value {
        self.poll_table.as_json()
    }

    /// Bind 6454, send the first ArtPoll and go to `On`.
    pub async fn start(&mut self) -> Result<()> {
        let udp = socket::bind(self.bind_address, artnet::ARTNET_PORT)?;
        self.socket = Some(Arc::new(udp));
        self.status = Status::On;

        let now = self.host.now_millis();
        self.last_poll_millis = now;
        self.send_poll();

        log::info!("Art-Net controller up on {}:{}", self.bind_address, artnet::ARTNET_PORT);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.status = Status::Off;
        log::info!("Art-Net controller stopped");
    }

    /// The cooperative loop. Returns after a shutdown signal.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = self.socket.clone().ok_or(Error::NotRunning)?;
        let mut buf = vec![0u8; 2048];
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
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((length, from)) => {
                            if let IpAddr::V4(from) = from.ip() {
                                self.handle_packet(&buf[..length], from);
                            }
                        }
                        Err(error) => {
                            if error.kind() != std::io::ErrorKind::WouldBlock {
                                log::warn!("Art-Net receive error: {}", error);
                            }
                        }
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
                log::warn!("Art-Net send to {} failed: {}", target, error);
            }
        }
    }

    fn queue(&mut self, data: Vec<u8>, ip: Ipv4Addr) {
        self.outbound.push_back((data, SocketAddrV4::new(ip, artnet::ARTNET_PORT)));
    }

    /// Dispatch one received datagram.
    pub fn handle_packet(&mut self, data: &[u8], from: Ipv4Addr) {
        if self.status != Status::On {
            return;
        }

        let packet = match artnet::classify(data) {
            Ok(packet) => packet,
            Err(reason) => {
                log::trace!("dropped datagram from {}: {:?}", from, reason);
                return;
            }
        };

        match packet {
            ArtPacket::PollReply(reply) => {
                // Our own broadcast replies come back too
                if from != self.host.local_ip() {
                    let now = self.host.now_millis();
                    self.poll_table.add(&reply, now);
                }
            }
            ArtPacket::Poll(_) => self.send_poll_reply(from),
            ArtPacket::Trigger(trigger) => {
                if trigger.oem == 0xffff || trigger.oem == self.oem {
                    if let Some(sink) = self.trigger.as_mut() {
                        sink.on_trigger(trigger.key, trigger.sub_key, &trigger.payload);
                    }
                }
            }
            _ => {}
        }
    }

    /// Drive the discovery timers.
    pub fn tick(&mut self) {
        if self.status != Status::On {
            return;
        }

        let now = self.host.now_millis();

        if now.wrapping_sub(self.last_poll_millis) > artnet::POLL_INTERVAL_MILLIS {
            self.last_poll_millis = now;
            self.send_poll();
        }

        if now.wrapping_sub(self.last_clean_millis) > CLEAN_INTERVAL_MILLIS {
            self.last_clean_millis = now;
            self.poll_table.clean(now);
        }
    }

    fn send_poll(&mut self) {
        let poll = artnet::ArtPoll {
            flags: artnet::poll_flags::SEND_REPLY_ON_CHANGE,
            diag_priority: 0,
            ..artnet::ArtPoll::default()
        };
        let broadcast = self.host.broadcast_ip();
        self.queue(poll.to_bytes(), broadcast);
    }

    fn send_poll_reply(&mut self, destination: Ipv4Addr) {
        self.poll_reply_count = self.poll_reply_count.wrapping_add(1);

        let reply = artnet::ArtPollReply {
            ip_address: self.host.local_ip().octets(),
            net_switch: 0,
            sub_switch: 0,
            oem: self.oem,
            status1: artnet::status1::INDICATOR_NORMAL_MODE | artnet::status1::PAP_NETWORK,
            esta_manufacturer: self.esta,
            short_name: self.short_name.clone(),
            long_name: self.long_name.clone(),
            node_report: format!("#0001 [{}]", self.poll_reply_count),
            style: artnet::style::SERVER,
            mac_address: self.host.mac(),
            bind_ip: self.host.local_ip().octets(),
            bind_index: 1,
            status2: artnet::status2::PORT_ADDRESS_15BIT,
            ..artnet::ArtPollReply::default()
        };

        self.queue(reply.to_bytes(), destination);
    }

    /// Dispatch one universe of DMX onto the network. Returns false when
    /// the active-universe table is full and the frame was dropped.
    pub fn handle_dmx_out(&mut self, universe: u16, data: &[u8]) -> bool {
        if self.status != Status::On {
            return false;
        }

        let sequence = match self.next_sequence(universe) {
            Some(sequence) => sequence,
            None => return false,
        };

        let mut frame = data[..data.len().min(512)].to_vec();
        self.apply_master(&mut frame);

        let dmx = artnet::ArtDmx {
            sequence,
            physical: 0,
            port_address: universe,
            data: frame,
        };
        let bytes = dmx.to_bytes();

        // If the number of subscribers exceeds 40, broadcasting is the
        // sensible transport
        if self.unicast && !self.force_broadcast {
            if let Some(subscribers) = self.poll_table.subscribers(universe) {
                if subscribers.len() <= UNICAST_LIMIT {
                    let targets: Vec<Ipv4Addr> = subscribers.to_vec();
                    for ip in targets {
                        self.queue(bytes.clone(), ip);
                    }
                    self.dmx_handled = true;
                    return true;
                }
            } else {
                // Nobody listens to this universe yet
                return true;
            }
        }

        let broadcast = self.host.broadcast_ip();
        self.queue(bytes, broadcast);
        self.dmx_handled = true;
        true
    }

    /// Send the trailing ArtSync when a burst was dispatched.
    pub fn handle_sync(&mut self) {
        if self.synchronization && self.dmx_handled {
            self.dmx_handled = false;
            let broadcast = self.host.broadcast_ip();
            self.queue(artnet::sync_to_bytes(), broadcast);
        }
    }

    /// Zero every universe this controller has been driving.
    pub fn blackout(&mut self) {
        let universes: Vec<u16> = self.active_universes.iter().map(|u| u.universe).collect();
        for universe in universes {
            self.handle_dmx_out(universe, &[0u8; 512]);
        }
        self.handle_sync();
    }

    fn next_sequence(&mut self, universe: u16) -> Option<u8> {
        match self
            .active_universes
            .binary_search_by_key(&universe, |entry| entry.universe)
        {
            Ok(index) => {
                let entry = &mut self.active_universes[index];
                entry.sequence = if entry.sequence == 255 { 1 } else { entry.sequence + 1 };
                Some(entry.sequence)
            }
            Err(insert_at) => {
                if self.active_universes.len() == MAX_ACTIVE_UNIVERSES {
                    return None;
                }
                self.active_universes
                    .insert(insert_at, ActiveUniverse { universe, sequence: 1 });
                Some(1)
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
    use crate::network::testutil::{FakeHost, SharedHost};
    use crate::network::port_address::PortAddress;

    fn controller(config: ArtControllerConfig) -> (ArtController, Arc<FakeHost>) {
        let host = Arc::new(FakeHost::new());
        let mut controller = ArtController::new(config, Box::new(SharedHost(host.clone())));
        controller.status = Status::On;
        (controller, host)
    }

    fn node_reply(ip: [u8; 4], universe: u8) -> Vec<u8> {
        artnet::ArtPollReply {
            ip_address: ip,
            num_ports: 1,
            port_types: [artnet::port_type::OUTPUT_ARTNET, 0, 0, 0],
            sw_out: [universe, 0, 0, 0],
            bind_index: 1,
            ..artnet::ArtPollReply::default()
        }
        .to_bytes()
    }

    fn drain_dmx(controller: &mut ArtController) -> Vec<(artnet::ArtDmx, Ipv4Addr)> {
        let mut frames = Vec::new();
        while let Some((data, target)) = controller.outbound.pop_front() {
            if let Ok(ArtPacket::Dmx(dmx)) = artnet::classify(&data) {
                frames.push((dmx, *target.ip()));
            }
        }
        frames
    }

    #[test]
    fn sequence_numbers_cycle_from_1_to_255_without_zero() {
        let (mut controller, _host) = controller(ArtControllerConfig {
            unicast: false,
            ..ArtControllerConfig::default()
        });

        let mut sequences = Vec::new();
        for _ in 0..300 {
            assert!(controller.handle_dmx_out(1, &[0u8; 512]));
        }
        for (dmx, _) in drain_dmx(&mut controller) {
            sequences.push(dmx.sequence);
        }

        assert_eq!(sequences.len(), 300);
        assert!(sequences.iter().all(|&s| s != 0));
        assert_eq!(&sequences[..3], &[1, 2, 3]);
        assert_eq!(sequences[254], 255);
        assert_eq!(sequences[255], 1);
    }

    #[test]
    fn dmx_unicasts_to_every_subscriber() {
        let (mut controller, _host) = controller(ArtControllerConfig::default());
        let universe = PortAddress::compose(0, 0, 1).value();

        controller.handle_packet(&node_reply([10, 0, 0, 2], 1), Ipv4Addr::new(10, 0, 0, 2));
        controller.handle_packet(&node_reply([10, 0, 0, 3], 1), Ipv4Addr::new(10, 0, 0, 3));

        assert!(controller.handle_dmx_out(universe, &[0x20u8; 512]));

        let frames = drain_dmx(&mut controller);
        let targets: Vec<Ipv4Addr> = frames.iter().map(|(_, ip)| *ip).collect();
        assert_eq!(frames.len(), 2);
        assert!(targets.contains(&Ipv4Addr::new(10, 0, 0, 2)));
        assert!(targets.contains(&Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn more_than_forty_subscribers_switch_to_broadcast() {
        let (mut controller, _host) = controller(ArtControllerConfig::default());
        let universe = PortAddress::compose(0, 0, 1).value();

        for last in 1..=41u8 {
            let ip = [10, 0, 1, last];
            controller.handle_packet(&node_reply(ip, 1), Ipv4Addr::from(ip));
        }

        assert!(controller.handle_dmx_out(universe, &[0x20u8; 512]));

        let frames = drain_dmx(&mut controller);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn unknown_universes_send_nothing_in_unicast_mode() {
        let (mut controller, _host) = controller(ArtControllerConfig::default());
        assert!(controller.handle_dmx_out(0x0005, &[0u8; 512]));
        assert!(drain_dmx(&mut controller).is_empty());
    }

    #[test]
    fn master_attenuator_scales_levels() {
        let (mut controller, _host) = controller(ArtControllerConfig {
            unicast: false,
            master: 128,
            ..ArtControllerConfig::default()
        });

        controller.handle_dmx_out(1, &[0xff, 0x80, 0x00, 0x40]);
        let frames = drain_dmx(&mut controller);
        assert_eq!(&frames[0].0.data[..4], &[128, 64, 0, 32]);
    }

    #[test]
    fn sync_follows_a_burst_when_enabled() {
        let (mut controller, _host) = controller(ArtControllerConfig {
            unicast: false,
            synchronization: true,
            ..ArtControllerConfig::default()
        });

        controller.handle_dmx_out(1, &[0u8; 512]);
        controller.handle_dmx_out(2, &[0u8; 512]);
        controller.handle_sync();
        // A second sync without new DMX does nothing
        controller.handle_sync();

        let mut kinds = Vec::new();
        while let Some((data, _)) = controller.outbound.pop_front() {
            kinds.push(match artnet::classify(&data).unwrap() {
                ArtPacket::Dmx(_) => "dmx",
                ArtPacket::Sync => "sync",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["dmx", "dmx", "sync"]);
    }

    #[test]
    fn discovery_polls_every_eight_seconds_and_cleans_the_table() {
        let (mut controller, host) = controller(ArtControllerConfig::default());

        controller.handle_packet(&node_reply([10, 0, 0, 2], 1), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(controller.poll_table().len(), 1);

        host.advance(artnet::POLL_INTERVAL_MILLIS + 1);
        controller.tick();

        let polls = controller
            .outbound
            .iter()
            .filter(|(data, _)| matches!(artnet::classify(data), Ok(ArtPacket::Poll(_))))
            .count();
        assert_eq!(polls, 1);

        // Keep ticking past expiry: the incremental clean removes the node
        for _ in 0..32 {
            host.advance(CLEAN_INTERVAL_MILLIS + 1);
            controller.tick();
        }
        assert_eq!(controller.poll_table().len(), 0);
    }

    #[test]
    fn own_poll_replies_are_not_added_to_the_table() {
        let (mut controller, host) = controller(ArtControllerConfig::default());
        let own_ip = host.local_ip;

        controller.handle_packet(&node_reply(own_ip.octets(), 1), own_ip);
        assert_eq!(controller.poll_table().len(), 0);
    }

    #[test]
    fn blackout_zeroes_every_active_universe() {
        let (mut controller, _host) = controller(ArtControllerConfig {
            unicast: false,
            ..ArtControllerConfig::default()
        });

        controller.handle_dmx_out(1, &[0x55u8; 512]);
        controller.handle_dmx_out(9, &[0x55u8; 512]);
        drain_dmx(&mut controller);

        controller.blackout();
        let frames = drain_dmx(&mut controller);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|(dmx, _)| dmx.data.iter().all(|&v| v == 0)));
    }
}
