// sACN E1.31 bridge (node-side receiver/input engine)
//
// Receives Data packets on 5568 for every output universe it joined,
// arbitrates sources by priority, windows sequence numbers, merges two
// sources per port and tracks universe synchronization. Local DMX
// inputs are sent out as Data packets and can loop back into a matching
// output's merger.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::dmx::DmxPort;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::lightset::{FailSafe, LightSet, MergeMode, PortDir, UNIVERSE_SIZE};
use crate::network::merge::{Ingest, MergeEngine, Slot};
use crate::network::sacn::{self, SacnPacket};
use crate::network::socket;
use crate::network::store::FrameStoreHandle;
use crate::PORTS;

/// The out-of-order window: a frame whose signed difference from the
/// last accepted sequence number falls in (-20, 0] is discarded
const SEQUENCE_WINDOW: i8 = -20;

/// Stream-terminated packets are sent this many times
const TERMINATED_REPEATS: usize = 3;

/// Transmit/merge flags shared with the Art-Net node so RDM gating on a
/// protocol-switched port can consult the bridge without owning it.
pub struct SacnStatus {
    flags: RwLock<[(bool, bool); PORTS]>,
}

impl SacnStatus {
    pub fn new() -> Self {
        Self {
            flags: RwLock::new([(false, false); PORTS]),
        }
    }

    pub fn set(&self, port: usize, transmitting: bool, merging: bool) {
        if port < PORTS {
            self.flags.write()[port] = (transmitting, merging);
        }
    }

    /// Transmitting or merging
    pub fn is_active(&self, port: usize) -> bool {
        if port >= PORTS {
            return false;
        }
        let (transmitting, merging) = self.flags.read()[port];
        transmitting || merging
    }
}

impl Default for SacnStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub type SacnStatusHandle = Arc<SacnStatus>;

/// Static configuration of one bridge port
#[derive(Debug, Clone)]
pub struct SacnPortConfig {
    pub direction: PortDir,
    pub universe: u16,
    pub merge_mode: MergeMode,
    /// Transmit priority for input ports
    pub priority: u8,
}

impl Default for SacnPortConfig {
    fn default() -> Self {
        Self {
            direction: PortDir::Disabled,
            universe: 1,
            merge_mode: MergeMode::Htp,
            priority: sacn::priority::DEFAULT,
        }
    }
}

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct SacnBridgeConfig {
    pub source_name: String,
    pub bind_address: Ipv4Addr,
    pub ports: Vec<SacnPortConfig>,
    pub failsafe: FailSafe,
    pub disable_merge_timeout: bool,
    /// Output immediately even when a synchronization address is active
    pub disable_synchronize: bool,
}

impl Default for SacnBridgeConfig {
    fn default() -> Self {
        Self {
            source_name: "lxnode sACN bridge".into(),
            bind_address: Ipv4Addr::UNSPECIFIED,
            ports: Vec::new(),
            failsafe: FailSafe::Hold,
            disable_merge_timeout: false,
            disable_synchronize: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    StandBy,
    On,
    Off,
}

struct OutputPort {
    universe: u16,
    merge: MergeEngine,
    /// Winning priority on this port; lower offers wait for a timeout
    priority: u8,
    is_transmitting: bool,
    data_pending: bool,
}

struct InputPort {
    universe: u16,
    sequence: u8,
    priority: u8,
    multicast_ip: Ipv4Addr,
    local_merge: bool,
    last_frame: Vec<u8>,
    had_data: bool,
}

/// The sACN E1.31 bridge engine
pub struct SacnBridge {
    host: Box<dyn Host + Send>,
    lightset: Box<dyn LightSet + Send>,
    dmx: Option<Box<dyn DmxPort + Send>>,
    frame_store: Option<FrameStoreHandle>,
    status_handle: SacnStatusHandle,

    status: Status,
    direction: [PortDir; PORTS],
    outputs: [OutputPort; PORTS],
    inputs: [InputPort; PORTS],

    source_name: String,
    cid: [u8; 16],
    failsafe: FailSafe,
    bind_address: Ipv4Addr,
    disable_merge_timeout: bool,
    disable_synchronize: bool,

    sync_address_source_a: u16,
    sync_address_source_b: u16,
    is_synchronized: bool,
    is_forced_synchronized: bool,
    synchronization_millis: u32,

    last_dmx_millis: u32,
    dmx_seen: bool,
    network_loss_fired: bool,
    discovery_millis: u32,

    pending_joins: Vec<Ipv4Addr>,
    pending_leaves: Vec<Ipv4Addr>,
    outbound: VecDeque<(Vec<u8>, SocketAddrV4)>,
    socket: Option<Arc<UdpSocket>>,
}

impl SacnBridge {
    pub fn new(
        config: SacnBridgeConfig,
        host: Box<dyn Host + Send>,
        lightset: Box<dyn LightSet + Send>,
    ) -> Self {
        let mut direction = [PortDir::Disabled; PORTS];
        let mut outputs: [OutputPort; PORTS] = std::array::from_fn(|_| OutputPort {
            universe: 1,
            merge: MergeEngine::new(MergeMode::Htp),
            priority: sacn::priority::LOWEST,
            is_transmitting: false,
            data_pending: false,
        });
        let mut inputs: [InputPort; PORTS] = std::array::from_fn(|_| InputPort {
            universe: 1,
            sequence: 0,
            priority: sacn::priority::DEFAULT,
            multicast_ip: sacn::multicast_ip(1),
            local_merge: false,
            last_frame: Vec::new(),
            had_data: false,
        });

        for (index, port) in config.ports.iter().take(PORTS).enumerate() {
            direction[index] = port.direction;
            outputs[index].universe = port.universe;
            outputs[index].merge = MergeEngine::new(port.merge_mode);
            inputs[index].universe = port.universe;
            inputs[index].priority = port.priority;
            inputs[index].multicast_ip = sacn::multicast_ip(port.universe);
        }

        let cid = host.cid();

        let mut bridge = Self {
            host,
            lightset,
            dmx: None,
            frame_store: None,
            status_handle: Arc::new(SacnStatus::new()),
            status: Status::StandBy,
            direction,
            outputs,
            inputs,
            source_name: config.source_name,
            cid,
            failsafe: config.failsafe,
            bind_address: config.bind_address,
            disable_merge_timeout: config.disable_merge_timeout,
            disable_synchronize: config.disable_synchronize,
            sync_address_source_a: 0,
            sync_address_source_b: 0,
            is_synchronized: false,
            is_forced_synchronized: false,
            synchronization_millis: 0,
            last_dmx_millis: 0,
            dmx_seen: false,
            network_loss_fired: false,
            discovery_millis: 0,
            pending_joins: Vec::new(),
            pending_leaves: Vec::new(),
            outbound: VecDeque::new(),
            socket: None,
        };

        bridge.set_local_merging();
        bridge
    }

    pub fn set_dmx_port(&mut self, dmx: Box<dyn DmxPort + Send>) {
        self.dmx = Some(dmx);
    }

    pub fn set_frame_store(&mut self, store: FrameStoreHandle) {
        self.frame_store = Some(store);
    }

    /// Handle shared with the Art-Net node for RDM gating
    pub fn status_handle(&self) -> SacnStatusHandle {
        self.status_handle.clone()
    }

    pub fn set_merge_mode(&mut self, port: usize, merge_mode: MergeMode) {
        if port < PORTS {
            self.outputs[port].merge.set_merge_mode(merge_mode);
        }
    }

    pub fn set_failsafe(&mut self, failsafe: FailSafe) {
        self.failsafe = failsafe;
    }

    /// Bind 5568, join the data groups of every output universe and go
    /// to `On`.
    pub async fn start(&mut self) -> Result<()> {
        let udp = socket::bind(self.bind_address, sacn::SACN_PORT)?;
        let socket = Arc::new(udp);

        for port in 0..PORTS {
            if self.direction[port] == PortDir::Output {
                self.pending_joins.push(sacn::multicast_ip(self.outputs[port].universe));
            }
            if self.direction[port] == PortDir::Input {
                if let Some(dmx) = self.dmx.as_mut() {
                    dmx.open(port, PortDir::Input);
                }
            }
        }

        self.apply_membership(&socket);
        self.socket = Some(socket);
        self.status = Status::On;
        log::info!("sACN bridge up on {}:{}", self.bind_address, sacn::SACN_PORT);
        Ok(())
    }

    /// Flush outputs, apply the failsafe, leave the groups, go to `Off`.
    pub fn stop(&mut self) {
        for port in 0..PORTS {
            if self.direction[port] == PortDir::Output {
                self.lightset.stop(port);
                self.outputs[port].merge.clear_length();
                self.outputs[port].is_transmitting = false;
                self.status_handle.set(port, false, false);
                self.pending_leaves.push(sacn::multicast_ip(self.outputs[port].universe));
            }
            if self.direction[port] == PortDir::Input {
                if let Some(dmx) = self.dmx.as_mut() {
                    dmx.close(port);
                }
            }
        }

        if self.sync_address_source_a != 0 {
            self.pending_leaves.push(sacn::multicast_ip(self.sync_address_source_a));
        }
        if self.sync_address_source_b != 0 {
            self.pending_leaves.push(sacn::multicast_ip(self.sync_address_source_b));
        }

        self.status = Status::Off;
        log::info!("sACN bridge stopped");
    }

    /// The cooperative loop. Returns after a shutdown signal, having
    /// performed `stop()`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = self.socket.clone().ok_or(Error::NotRunning)?;
        let mut buf = vec![0u8; 1500];
        let mut ticker = tokio::time::interval(Duration::from_millis(25));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            self.apply_membership(&socket);
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
                                log::warn!("sACN receive error: {}", error);
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
        self.apply_membership(&socket);
        self.flush_outbound(&socket).await;
        Ok(())
    }

    fn apply_membership(&mut self, socket: &UdpSocket) {
        for group in self.pending_joins.drain(..) {
            match socket::join_multicast(socket, group, self.bind_address) {
                Ok(()) => log::info!("Joined multicast group {}", group),
                Err(error) => log::warn!("Failed to join multicast group {}: {}", group, error),
            }
        }
        for group in self.pending_leaves.drain(..) {
            if let Err(error) = socket::leave_multicast(socket, group, self.bind_address) {
                log::warn!("Failed to leave multicast group {}: {}", group, error);
            }
        }
    }

    async fn flush_outbound(&mut self, socket: &UdpSocket) {
        while let Some((data, target)) = self.outbound.pop_front() {
            if let Err(error) = socket.send_to(&data, target).await {
                log::warn!("sACN send to {} failed: {}", target, error);
            }
        }
    }

    /// Dispatch one received datagram.
    pub fn handle_packet(&mut self, data: &[u8], from: Ipv4Addr) {
        if self.status != Status::On {
            return;
        }

        let packet = match sacn::classify(data) {
            Ok(packet) => packet,
            Err(reason) => {
                log::trace!("dropped sACN datagram from {}: {:?}", from, reason);
                return;
            }
        };

        let now = self.host.now_millis();

        match packet {
            SacnPacket::Data(packet) => self.handle_data(&packet, from, now),
            SacnPacket::Sync(sync) => self.handle_synchronization(&sync, now),
            // A bridge does not consume discovery packets
            SacnPacket::Discovery(_) => {}
        }
    }

    fn handle_data(&mut self, packet: &sacn::DataPacket, from: Ipv4Addr, now: u32) {
        // Alternative start codes (RDM, text) are not live levels
        if packet.start_code != 0 {
            return;
        }

        for port in 0..PORTS {
            if self.direction[port] != PortDir::Output {
                continue;
            }
            // 8.2: universe identity comes from the packet, never from
            // the multicast address it arrived on
            if self.outputs[port].universe != packet.universe {
                continue;
            }

            let matched = self.outputs[port].merge.slot_of(from, Some(&packet.cid));

            // 6.9.2 sequence numbering: the window applies per source
            if let Some(slot) = matched {
                let source = self.outputs[port].merge.source_mut(slot);
                let diff = packet.sequence.wrapping_sub(source.sequence) as i8;
                source.sequence = packet.sequence;
                if diff <= 0 && diff > SEQUENCE_WINDOW {
                    continue;
                }
            }

            if packet.options & sacn::options::PREVIEW_DATA != 0 {
                continue;
            }

            if packet.options & sacn::options::STREAM_TERMINATED != 0 {
                if let Some(slot) = matched {
                    self.outputs[port].merge.evict(slot);
                    if self.outputs[port].merge.active_sources() == 0 {
                        self.set_port_data_loss(port);
                    }
                }
                continue;
            }

            if self.outputs[port].merge.is_merging() && !self.disable_merge_timeout {
                self.outputs[port].merge.sweep(now);
            }

            // Priority arbitration
            let current = self.outputs[port].priority;
            if packet.priority < current {
                if !self.is_priority_timeout(port, now) {
                    continue;
                }
                // The old winner is gone; drop its stale slots before
                // the lower-priority source takes over
                self.outputs[port].merge.sweep(now);
                self.outputs[port].priority = packet.priority;
            } else if packet.priority > current {
                self.outputs[port].merge.cancel();
                self.outputs[port].priority = packet.priority;
            }

            if self.outputs[port]
                .merge
                .ingest(from, Some(packet.cid), packet.sequence, &packet.data, now)
                == Ingest::Dropped
            {
                continue;
            }

            self.last_dmx_millis = now;
            self.dmx_seen = true;
            self.network_loss_fired = false;

            // Universe synchronization (11.1): without the force bit the
            // output locks to the synchronization universe
            if packet.options & sacn::options::FORCE_SYNCHRONIZATION == 0 {
                if packet.synchronization_address != 0 && !self.is_forced_synchronized {
                    let slot = self
                        .outputs[port]
                        .merge
                        .slot_of(from, Some(&packet.cid))
                        .unwrap_or(Slot::A);
                    self.set_synchronization_address(slot, packet.synchronization_address);
                    self.is_forced_synchronized = true;
                    self.is_synchronized = true;
                }
            } else {
                self.is_forced_synchronized = false;
            }

            let do_update = !self.is_synchronized || self.disable_synchronize;
            let frame = self.outputs[port].merge.merged().to_vec();

            if do_update {
                self.lightset.set_data(port, &frame, true);

                if let Some(store) = self.frame_store.as_ref() {
                    store.update(packet.universe, &frame);
                }

                if !self.outputs[port].is_transmitting {
                    self.lightset.start(port);
                    self.outputs[port].is_transmitting = true;
                }
            } else {
                self.lightset.set_data(port, &frame, false);
                self.outputs[port].data_pending = true;
            }

            self.status_handle.set(
                port,
                self.outputs[port].is_transmitting,
                self.outputs[port].merge.is_merging(),
            );
        }
    }

    fn is_priority_timeout(&self, port: usize, now: u32) -> bool {
        let merge = &self.outputs[port].merge;
        let source_a = merge.source(Slot::A);
        let source_b = merge.source(Slot::B);

        let timed_out = |source: &crate::network::merge::Source| {
            now.wrapping_sub(source.last_millis) > sacn::PRIORITY_TIMEOUT_MILLIS
        };

        match (!source_a.is_empty(), !source_b.is_empty()) {
            (true, true) => timed_out(source_a) && timed_out(source_b),
            (true, false) => timed_out(source_a),
            (false, true) => timed_out(source_b),
            (false, false) => false,
        }
    }

    fn set_synchronization_address(&mut self, slot: Slot, address: u16) {
        let current = match slot {
            Slot::A => self.sync_address_source_a,
            Slot::B => self.sync_address_source_b,
        };

        if current == address {
            return;
        }

        if current != 0 && !self.sync_address_in_use(current, slot) {
            self.pending_leaves.push(sacn::multicast_ip(current));
        }

        match slot {
            Slot::A => self.sync_address_source_a = address,
            Slot::B => self.sync_address_source_b = address,
        }

        self.pending_joins.push(sacn::multicast_ip(address));
    }

    /// Whether another slot or output universe still needs the group
    fn sync_address_in_use(&self, address: u16, leaving: Slot) -> bool {
        let other = match leaving {
            Slot::A => self.sync_address_source_b,
            Slot::B => self.sync_address_source_a,
        };
        if other == address {
            return true;
        }
        (0..PORTS).any(|port| {
            self.direction[port] == PortDir::Output && self.outputs[port].universe == address
        })
    }

    fn handle_synchronization(&mut self, sync: &sacn::SyncPacket, now: u32) {
        // Only act on synchronization addresses one of our sources
        // announced (6.3.3.1)
        if sync.synchronization_address != self.sync_address_source_a
            && sync.synchronization_address != self.sync_address_source_b
        {
            return;
        }

        self.synchronization_millis = now;

        for port in 0..PORTS {
            if self.outputs[port].data_pending {
                self.lightset.sync(port);
                self.outputs[port].data_pending = false;

                if !self.outputs[port].is_transmitting {
                    self.lightset.start(port);
                    self.outputs[port].is_transmitting = true;
                }
                self.status_handle.set(
                    port,
                    true,
                    self.outputs[port].merge.is_merging(),
                );
            }
        }
    }

    /// One output port lost both sources
    fn set_port_data_loss(&mut self, port: usize) {
        self.outputs[port].merge.cancel();
        self.outputs[port].merge.clear_length();
        self.outputs[port].priority = sacn::priority::LOWEST;

        if self.outputs[port].is_transmitting {
            self.outputs[port].is_transmitting = false;
            self.apply_failsafe();
        }

        self.status_handle.set(port, false, false);
        self.set_local_merging();
    }

    fn set_network_data_loss(&mut self) {
        self.network_loss_fired = true;
        self.dmx_seen = false;
        self.is_synchronized = false;
        self.is_forced_synchronized = false;

        let mut do_failsafe = false;

        for port in 0..PORTS {
            if self.direction[port] != PortDir::Output {
                continue;
            }
            if self.outputs[port].is_transmitting {
                do_failsafe = true;
                self.outputs[port].is_transmitting = false;
            }
            self.outputs[port].merge.cancel();
            self.outputs[port].merge.clear_length();
            self.outputs[port].priority = sacn::priority::LOWEST;
            self.status_handle.set(port, false, false);
        }

        if do_failsafe {
            log::info!("sACN network data loss, applying failsafe {:?}", self.failsafe);
            self.apply_failsafe();
        }

        self.set_local_merging();
    }

    fn apply_failsafe(&mut self) {
        match self.failsafe {
            FailSafe::Hold => {}
            FailSafe::Zero => self.lightset.blackout(true),
            FailSafe::Full => {
                let full = [0xffu8; UNIVERSE_SIZE];
                for port in 0..PORTS {
                    if self.direction[port] == PortDir::Output {
                        self.lightset.set_data(port, &full, true);
                    }
                }
            }
            FailSafe::PlaybackScene | FailSafe::RecordScene => {
                log::warn!("failsafe scene not supported, holding last state");
            }
        }
    }

    /// When a local input shares a universe with a local output, the
    /// input loops back into the output's merger under the local IP.
    fn set_local_merging(&mut self) {
        let local_ip = self.host.local_ip();

        for input_index in 0..PORTS {
            if self.direction[input_index] != PortDir::Input {
                continue;
            }
            self.inputs[input_index].local_merge = false;

            for output_index in 0..PORTS {
                if self.direction[output_index] != PortDir::Output {
                    continue;
                }

                if self.inputs[input_index].universe == self.outputs[output_index].universe {
                    if self.outputs[output_index].merge.slot_of(local_ip, None).is_none() {
                        self.outputs[output_index].merge.bind_local(local_ip);
                    }
                    self.inputs[input_index].local_merge = true;
                }
            }
        }
    }

    /// Drive the timers; called on every loop tick.
    pub fn tick(&mut self) {
        if self.status != Status::On {
            return;
        }

        let now = self.host.now_millis();

        // Synchronization loss: with the force option the ports fall
        // through to asynchronous output
        if self.is_synchronized
            && !self.is_forced_synchronized
            && now.wrapping_sub(self.synchronization_millis) >= sacn::NETWORK_DATA_LOSS_TIMEOUT_MILLIS
        {
            self.is_synchronized = false;
        }

        if self.dmx_seen
            && !self.network_loss_fired
            && now.wrapping_sub(self.last_dmx_millis) >= sacn::NETWORK_DATA_LOSS_TIMEOUT_MILLIS
        {
            self.set_network_data_loss();
        }

        if now.wrapping_sub(self.discovery_millis) >= sacn::UNIVERSE_DISCOVERY_INTERVAL_MILLIS {
            self.discovery_millis = now;
            self.send_discovery();
        }

        self.handle_dmx_in(now);
    }

    fn send_discovery(&mut self) {
        let universes: Vec<u16> = (0..PORTS)
            .filter(|&port| self.direction[port] == PortDir::Input)
            .map(|port| self.inputs[port].universe)
            .collect();

        if universes.is_empty() {
            return;
        }

        let packet = sacn::DiscoveryPacket {
            cid: self.cid,
            source_name: self.source_name.clone(),
            page: 0,
            last_page: 0,
            universes,
        };

        self.outbound.push_back((
            packet.to_bytes(),
            sacn::multicast_target(sacn::DISCOVERY_UNIVERSE),
        ));
    }

    fn handle_dmx_in(&mut self, now: u32) {
        let mut dmx = match self.dmx.take() {
            Some(dmx) => dmx,
            None => return,
        };

        for port in 0..PORTS {
            if self.direction[port] != PortDir::Input {
                continue;
            }

            if let Some(frame) = dmx.read(port) {
                self.inputs[port].had_data = true;
                self.inputs[port].last_frame = frame.data.clone();
                self.send_dmx_in(port, frame.data, 0, now);
                continue;
            }

            if dmx.updates_per_second(port) == 0 && self.inputs[port].had_data {
                // The wire went quiet: terminate the stream
                self.inputs[port].had_data = false;
                let data = self.inputs[port].last_frame.clone();
                for _ in 0..TERMINATED_REPEATS {
                    self.send_dmx_in(port, data.clone(), sacn::options::STREAM_TERMINATED, now);
                }
            }
        }

        self.dmx = Some(dmx);
    }

    fn send_dmx_in(&mut self, port: usize, data: Vec<u8>, options: u8, now: u32) {
        self.inputs[port].sequence = self.inputs[port].sequence.wrapping_add(1);

        let packet = sacn::DataPacket {
            cid: self.cid,
            source_name: self.source_name.clone(),
            priority: self.inputs[port].priority,
            synchronization_address: 0,
            sequence: self.inputs[port].sequence,
            options,
            universe: self.inputs[port].universe,
            start_code: 0,
            data: data.clone(),
        };

        let target = SocketAddrV4::new(self.inputs[port].multicast_ip, sacn::SACN_PORT);
        self.outbound.push_back((packet.to_bytes(), target));

        if self.inputs[port].local_merge && options & sacn::options::STREAM_TERMINATED == 0 {
            let local_ip = self.host.local_ip();
            let universe = self.inputs[port].universe;
            self.local_merge_feed(universe, local_ip, &data, now);
        }
    }

    fn local_merge_feed(&mut self, universe: u16, local_ip: Ipv4Addr, data: &[u8], now: u32) {
        for port in 0..PORTS {
            if self.direction[port] != PortDir::Output || self.outputs[port].universe != universe {
                continue;
            }

            if self.outputs[port]
                .merge
                .ingest(local_ip, None, 0, data, now)
                == Ingest::Dropped
            {
                continue;
            }

            let frame = self.outputs[port].merge.merged().to_vec();
            self.lightset.set_data(port, &frame, true);

            if !self.outputs[port].is_transmitting {
                self.lightset.start(port);
                self.outputs[port].is_transmitting = true;
            }
            self.status_handle.set(
                port,
                true,
                self.outputs[port].merge.is_merging(),
            );
        }
    }
}
