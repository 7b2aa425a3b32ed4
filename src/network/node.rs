// Art-Net 4 node state machine
//
// One ArtNode owns the UDP socket on 6454, the per-port merge engines
// and all node state. `run()` drives the cooperative loop: receive,
// dispatch, timers, flush. Everything outbound goes through the queue so
// a Sync sent after a DMX burst can never overtake it.

use serde::Serialize;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::dmx::DmxPort;
use crate::error::{Error, Result};
use crate::host::{Host, TimeCodeSink, TriggerSink};
use crate::lightset::{FailSafe, LightSet, MergeMode, OutputStyle, PortDir, PortProtocol, UNIVERSE_SIZE};
use crate::network::artnet::{self, ArtPacket};
use crate::network::bridge::SacnStatusHandle;
use crate::network::merge::MergeEngine;
use crate::network::port_address::{program, PortAddress};
use crate::network::socket;
use crate::network::store::FrameStoreHandle;
use crate::rdm::{RdmProvider, TOD_BLOCK_SIZE, UID_SIZE};
use crate::PORTS;

/// Unsolicited replies are spread over a short window instead of going
/// out back-to-back with the triggering packet
const REPLY_DELAY_MILLIS: u32 = 25;

/// Quiet DMX inputs keep sending one frame per second
const INPUT_KEEPALIVE_MILLIS: u32 = 1_000;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    StandBy,
    On,
    Off,
}

/// Static configuration of one local port
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub direction: PortDir,
    pub port_address: PortAddress,
    pub protocol: PortProtocol,
    pub merge_mode: MergeMode,
    pub output_style: OutputStyle,
    pub rdm_enabled: bool,
    /// Input forwarding target; unspecified means broadcast
    pub destination_ip: Ipv4Addr,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            direction: PortDir::Disabled,
            // Art-Net devices power up at universe 1 on net/sub 0
            port_address: PortAddress::compose(0, 0, 1),
            protocol: PortProtocol::ArtNet,
            merge_mode: MergeMode::Htp,
            output_style: OutputStyle::Delta,
            rdm_enabled: false,
            destination_ip: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone)]
pub struct ArtNodeConfig {
    pub short_name: String,
    pub long_name: String,
    pub oem: u16,
    pub esta: u16,
    pub firmware_version: u16,
    pub failsafe: FailSafe,
    pub bind_address: Ipv4Addr,
    pub ports: Vec<PortConfig>,
    pub disable_merge_timeout: bool,
}

impl Default for ArtNodeConfig {
    fn default() -> Self {
        Self {
            short_name: "lxnode".into(),
            long_name: "lxnode Art-Net 4 node".into(),
            oem: 0x00ff,
            esta: 0x7ff0,
            firmware_version: 0x0100,
            failsafe: FailSafe::Hold,
            bind_address: Ipv4Addr::UNSPECIFIED,
            ports: Vec::new(),
            disable_merge_timeout: false,
        }
    }
}

struct OutputPort {
    port_address: u16,
    default_address: u8,
    protocol: PortProtocol,
    merge: MergeEngine,
    output_style: OutputStyle,
    rdm_enabled: bool,
    is_transmitting: bool,
    data_pending: bool,
    local_merge: bool,
}

struct InputPort {
    port_address: u16,
    default_address: u8,
    destination_ip: Ipv4Addr,
    sequence: u8,
    disabled_by_controller: bool,
    good_input: u8,
    local_merge: bool,
    last_frame: Vec<u8>,
    last_send_millis: u32,
}

struct Diagnostics {
    send: bool,
    ip: Ipv4Addr,
    priority: u8,
    first_controller: Ipv4Addr,
    multiple_controllers: bool,
}

struct ReplyQueueEntry {
    queued_millis: u32,
    destination: Ipv4Addr,
    target_top: u16,
    target_bottom: u16,
}

/// Per-port status snapshot (the programmatic get-status surface)
#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub direction: PortDir,
    pub protocol: PortProtocol,
    pub port_address: u16,
    pub is_transmitting: bool,
    pub is_merging: bool,
    pub rdm_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub status: Status,
    pub short_name: String,
    pub long_name: String,
    pub failsafe: FailSafe,
    pub ports: Vec<PortStatus>,
}

/// The Art-Net node engine
pub struct ArtNode {
    host: Box<dyn Host + Send>,
    lightset: Box<dyn LightSet + Send>,
    dmx: Option<Box<dyn DmxPort + Send>>,
    rdm: Option<Box<dyn RdmProvider + Send>>,
    rdm_is_responder: bool,
    trigger: Option<Box<dyn TriggerSink + Send>>,
    time_code: Option<Box<dyn TimeCodeSink + Send>>,
    frame_store: Option<FrameStoreHandle>,
    sacn_status: Option<SacnStatusHandle>,

    status: Status,
    direction: [PortDir; PORTS],
    outputs: [OutputPort; PORTS],
    inputs: [InputPort; PORTS],

    short_names: [String; PORTS],
    long_name: String,
    oem: u16,
    esta: u16,
    firmware_version: u16,
    failsafe: FailSafe,
    bind_address: Ipv4Addr,
    disable_merge_timeout: bool,

    status1: u8,
    report_code: u16,
    poll_reply_count: u32,

    send_reply_on_change: bool,
    is_changed: bool,
    diag: Diagnostics,

    is_synchronous: bool,
    sync_millis: u32,
    last_dmx_millis: u32,
    dmx_seen: bool,
    network_loss_fired: bool,

    reply_queue: VecDeque<ReplyQueueEntry>,
    outbound: VecDeque<(Vec<u8>, SocketAddrV4)>,
    socket: Option<Arc<UdpSocket>>,
}

impl ArtNode {
    pub fn new(
        config: ArtNodeConfig,
        host: Box<dyn Host + Send>,
        lightset: Box<dyn LightSet + Send>,
    ) -> Self {
        let mut direction = [PortDir::Disabled; PORTS];
        let mut outputs: [OutputPort; PORTS] = std::array::from_fn(|_| OutputPort {
            port_address: PortAddress::compose(0, 0, 1).value(),
            default_address: 1,
            protocol: PortProtocol::ArtNet,
            merge: MergeEngine::new(MergeMode::Htp),
            output_style: OutputStyle::Delta,
            rdm_enabled: false,
            is_transmitting: false,
            data_pending: false,
            local_merge: false,
        });
        let mut inputs: [InputPort; PORTS] = std::array::from_fn(|_| InputPort {
            port_address: PortAddress::compose(0, 0, 1).value(),
            default_address: 1,
            destination_ip: Ipv4Addr::UNSPECIFIED,
            sequence: 0,
            disabled_by_controller: false,
            good_input: 0,
            local_merge: false,
            last_frame: Vec::new(),
            last_send_millis: 0,
        });

        for (index, port) in config.ports.iter().take(PORTS).enumerate() {
            direction[index] = port.direction;
            outputs[index].port_address = port.port_address.value();
            outputs[index].default_address = port.port_address.universe();
            outputs[index].protocol = port.protocol;
            outputs[index].merge = MergeEngine::new(port.merge_mode);
            outputs[index].output_style = port.output_style;
            outputs[index].rdm_enabled = port.rdm_enabled;
            inputs[index].port_address = port.port_address.value();
            inputs[index].default_address = port.port_address.universe();
            inputs[index].destination_ip = port.destination_ip;
        }

        let mut node = Self {
            host,
            lightset,
            dmx: None,
            rdm: None,
            rdm_is_responder: false,
            trigger: None,
            time_code: None,
            frame_store: None,
            sacn_status: None,
            status: Status::StandBy,
            direction,
            outputs,
            inputs,
            short_names: std::array::from_fn(|_| config.short_name.clone()),
            long_name: config.long_name.clone(),
            oem: config.oem,
            esta: config.esta,
            firmware_version: config.firmware_version,
            failsafe: config.failsafe,
            bind_address: config.bind_address,
            disable_merge_timeout: config.disable_merge_timeout,
            status1: artnet::status1::INDICATOR_NORMAL_MODE | artnet::status1::PAP_NETWORK,
            report_code: artnet::report_code::POWER_OK,
            poll_reply_count: 0,
            send_reply_on_change: false,
            is_changed: false,
            diag: Diagnostics {
                send: false,
                ip: Ipv4Addr::UNSPECIFIED,
                priority: artnet::diag_priority::LOW,
                first_controller: Ipv4Addr::UNSPECIFIED,
                multiple_controllers: false,
            },
            is_synchronous: false,
            sync_millis: 0,
            last_dmx_millis: 0,
            dmx_seen: false,
            network_loss_fired: false,
            reply_queue: VecDeque::new(),
            outbound: VecDeque::new(),
            socket: None,
        };

        node.set_local_merging();
        node
    }

    pub fn set_dmx_port(&mut self, dmx: Box<dyn DmxPort + Send>) {
        self.dmx = Some(dmx);
    }

    pub fn set_rdm_provider(&mut self, rdm: Box<dyn RdmProvider + Send>, is_responder: bool) {
        self.rdm = Some(rdm);
        self.rdm_is_responder = is_responder;
        self.status1 |= artnet::status1::RDM_CAPABLE;
    }

    pub fn set_trigger_sink(&mut self, trigger: Box<dyn TriggerSink + Send>) {
        self.trigger = Some(trigger);
    }

    pub fn set_time_code_sink(&mut self, time_code: Box<dyn TimeCodeSink + Send>) {
        self.time_code = Some(time_code);
    }

    pub fn set_frame_store(&mut self, store: FrameStoreHandle) {
        self.frame_store = Some(store);
    }

    /// Share the sACN bridge's transmit flags so RDM gating on a
    /// protocol-switched port consults the right engine.
    pub fn set_sacn_status(&mut self, status: SacnStatusHandle) {
        self.sacn_status = Some(status);
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            status: self.status,
            short_name: self.short_names[0].clone(),
            long_name: self.long_name.clone(),
            failsafe: self.failsafe,
            ports: (0..PORTS)
                .map(|port| PortStatus {
                    direction: self.direction[port],
                    protocol: self.outputs[port].protocol,
                    port_address: match self.direction[port] {
                        PortDir::Input => self.inputs[port].port_address,
                        _ => self.outputs[port].port_address,
                    },
                    is_transmitting: self.outputs[port].is_transmitting,
                    is_merging: self.outputs[port].merge.is_merging(),
                    rdm_enabled: self.outputs[port].rdm_enabled,
                })
                .collect(),
        }
    }

    /// Bind the socket, announce ourselves and go to `On`.
    pub async fn start(&mut self) -> Result<()> {
        let udp = socket::bind(self.bind_address, artnet::ARTNET_PORT)?;
        self.socket = Some(Arc::new(udp));

        if let Some(dmx) = self.dmx.as_mut() {
            for port in 0..PORTS {
                if self.direction[port] == PortDir::Input {
                    dmx.open(port, PortDir::Input);
                }
            }
        }

        self.status = Status::On;
        log::info!("Art-Net node up on {}:{}", self.bind_address, artnet::ARTNET_PORT);

        // Unsolicited reply set on power-up
        let now = self.host.now_millis();
        self.queue_poll_reply(now, self.host.broadcast_ip(), 0x7fff, 0);
        Ok(())
    }

    /// Flush outputs, stop the drivers and go to `Off`.
    pub fn stop(&mut self) {
        for port in 0..PORTS {
            if self.direction[port] == PortDir::Output
                && self.outputs[port].protocol == PortProtocol::ArtNet
            {
                self.lightset.stop(port);
                self.outputs[port].merge.clear_length();
                self.outputs[port].is_transmitting = false;
            }
        }

        if let Some(dmx) = self.dmx.as_mut() {
            for port in 0..PORTS {
                if self.direction[port] == PortDir::Input {
                    dmx.close(port);
                }
            }
        }

        self.status1 = (self.status1 & !artnet::status1::INDICATOR_MASK)
            | artnet::status1::INDICATOR_MUTE_MODE;
        self.status = Status::Off;
        log::info!("Art-Net node stopped");
    }

    /// The cooperative loop: socket, timers, outbound flush. Returns
    /// after a shutdown signal, having performed `stop()`.
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

        let now = self.host.now_millis();

        if self.is_synchronous && now.wrapping_sub(self.sync_millis) >= artnet::SYNC_TIMEOUT_MILLIS {
            self.is_synchronous = false;
        }

        match packet {
            ArtPacket::Poll(poll) => self.handle_poll(&poll, from, now),
            ArtPacket::Dmx(dmx) => self.handle_dmx(&dmx, from, now),
            ArtPacket::Sync => self.handle_sync(now),
            ArtPacket::Address(address) => self.handle_address(&address, now),
            ArtPacket::Input(input) => self.handle_input(&input),
            ArtPacket::TodRequest(request) => self.handle_tod_request(&request),
            ArtPacket::TodControl(control) => self.handle_tod_control(&control),
            ArtPacket::Rdm(rdm) => self.handle_rdm(&rdm, from),
            ArtPacket::Trigger(trigger) => self.handle_trigger(&trigger),
            ArtPacket::IpProg(prog) => self.handle_ip_prog(&prog, from),
            ArtPacket::TimeCode(time_code) => {
                if let Some(sink) = self.time_code.as_mut() {
                    sink.on_time_code(time_code);
                }
            }
            // Recognised but nothing for a node to do
            ArtPacket::PollReply(_)
            | ArtPacket::DiagData(_)
            | ArtPacket::TimeSync
            | ArtPacket::TodData(_)
            | ArtPacket::RdmSub
            | ArtPacket::Directory
            | ArtPacket::IpProgReply(_) => {}
        }
    }

    /// Drive the timers; called on every loop tick.
    pub fn tick(&mut self) {
        if self.status != Status::On {
            return;
        }

        let now = self.host.now_millis();

        if self.is_synchronous && now.wrapping_sub(self.sync_millis) >= artnet::SYNC_TIMEOUT_MILLIS {
            self.is_synchronous = false;
        }

        if self.dmx_seen
            && !self.network_loss_fired
            && now.wrapping_sub(self.last_dmx_millis) >= artnet::NETWORK_DATA_LOSS_TIMEOUT_MILLIS
        {
            self.set_network_data_loss();
        }

        self.flush_reply_queue(now);

        if self.send_reply_on_change && self.is_changed {
            self.is_changed = false;
            self.queue_poll_reply(now, self.host.broadcast_ip(), 0x7fff, 0);
        }

        self.handle_dmx_in(now);
    }

    // --- Poll / PollReply ---

    fn handle_poll(&mut self, poll: &artnet::ArtPoll, from: Ipv4Addr, now: u32) {
        self.send_reply_on_change =
            poll.flags & artnet::poll_flags::SEND_REPLY_ON_CHANGE != 0;

        if poll.flags & artnet::poll_flags::SEND_DIAG_MESSAGES != 0 {
            self.diag.send = true;

            if self.diag.first_controller.is_unspecified() {
                self.diag.first_controller = from;
            } else if !self.diag.multiple_controllers && self.diag.first_controller != from {
                // Multiple controllers requesting diagnostics: broadcast,
                // lowest priority wins
                self.diag.multiple_controllers = true;
            }

            if self.diag.multiple_controllers {
                self.diag.ip = self.host.broadcast_ip();
                self.diag.priority = self.diag.priority.min(poll.diag_priority);
            } else {
                self.diag.priority = poll.diag_priority;
                self.diag.ip = if poll.flags & artnet::poll_flags::SEND_DIAG_UNICAST != 0 {
                    from
                } else {
                    self.host.broadcast_ip()
                };
            }
        } else {
            self.diag.send = false;
        }

        let (target_top, target_bottom) =
            if poll.flags & artnet::poll_flags::USE_TARGET_PORT_ADDRESS != 0 {
                (poll.target_top, poll.target_bottom)
            } else {
                (0x7fff, 0)
            };

        self.queue_poll_reply(now, self.host.broadcast_ip(), target_top, target_bottom);
    }

    fn queue_poll_reply(&mut self, now: u32, destination: Ipv4Addr, target_top: u16, target_bottom: u16) {
        self.reply_queue.push_back(ReplyQueueEntry {
            queued_millis: now,
            destination,
            target_top,
            target_bottom,
        });
    }

    fn flush_reply_queue(&mut self, now: u32) {
        loop {
            let due = matches!(
                self.reply_queue.front(),
                Some(entry) if now.wrapping_sub(entry.queued_millis) >= REPLY_DELAY_MILLIS
            );
            if !due {
                break;
            }
            if let Some(entry) = self.reply_queue.pop_front() {
                self.send_poll_reply(&entry);
            }
        }
    }

    fn send_poll_reply(&mut self, entry: &ReplyQueueEntry) {
        let local_ip = self.host.local_ip().octets();

        for port in 0..PORTS {
            if self.direction[port] == PortDir::Disabled {
                continue;
            }

            let port_address = match self.direction[port] {
                PortDir::Output => self.outputs[port].port_address,
                _ => self.inputs[port].port_address,
            };

            if port_address < entry.target_bottom || port_address > entry.target_top {
                continue;
            }

            self.poll_reply_count = self.poll_reply_count.wrapping_add(1);

            let mut reply = artnet::ArtPollReply {
                ip_address: local_ip,
                version_info: self.firmware_version,
                net_switch: (port_address >> 8) as u8 & 0x7f,
                sub_switch: (port_address >> 4) as u8 & 0x0f,
                oem: self.oem,
                status1: self.status1,
                esta_manufacturer: self.esta,
                short_name: self.short_names[port].clone(),
                long_name: self.long_name.clone(),
                node_report: format!(
                    "#{:04x} [{}] Power On Tests successful",
                    self.report_code, self.poll_reply_count
                ),
                num_ports: 1,
                acn_priority: crate::network::sacn::priority::DEFAULT,
                mac_address: self.host.mac(),
                bind_ip: local_ip,
                bind_index: (port + 1) as u8,
                status2: artnet::status2::PORT_ADDRESS_15BIT
                    | artnet::status2::SACN_ABLE_TO_SWITCH
                    | artnet::status2::OUTPUT_STYLE_SWITCH
                    | artnet::status2::RDM_SWITCH
                    | if self.host.is_dhcp() {
                        artnet::status2::IP_DHCP | artnet::status2::DHCP_CAPABLE
                    } else {
                        0
                    },
                status3: self.failsafe_status3() | artnet::status3::FAILSAFE_CONTROL,
                ..artnet::ArtPollReply::default()
            };

            match self.direction[port] {
                PortDir::Output => {
                    let output = &self.outputs[port];
                    reply.port_types[0] = artnet::port_type::OUTPUT_ARTNET;
                    reply.sw_out[0] = output.default_address;
                    reply.good_output[0] = self.good_output(port);

                    let mut good_b = 0;
                    if !output.rdm_enabled {
                        good_b |= artnet::good_output_b::RDM_DISABLED;
                    }
                    if output.output_style == OutputStyle::Constant {
                        good_b |= artnet::good_output_b::STYLE_CONSTANT;
                    }
                    reply.good_output_b[0] = good_b;
                }
                PortDir::Input => {
                    let input = &self.inputs[port];
                    reply.port_types[0] = artnet::port_type::INPUT_ARTNET;
                    reply.sw_in[0] = input.default_address;
                    reply.good_input[0] = input.good_input;
                }
                PortDir::Disabled => unreachable!(),
            }

            self.queue(reply.to_bytes(), entry.destination);
        }
    }

    fn good_output(&self, port: usize) -> u8 {
        let output = &self.outputs[port];
        let mut flags = 0;
        if output.is_transmitting {
            flags |= artnet::good_output::DATA_IS_BEING_TRANSMITTED;
        }
        if output.merge.is_merging() {
            flags |= artnet::good_output::OUTPUT_IS_MERGING;
        }
        if output.merge.merge_mode() == MergeMode::Ltp {
            flags |= artnet::good_output::MERGE_MODE_LTP;
        }
        if output.protocol == PortProtocol::Sacn {
            flags |= artnet::good_output::OUTPUT_IS_SACN;
        }
        flags
    }

    fn failsafe_status3(&self) -> u8 {
        match self.failsafe {
            FailSafe::Hold => artnet::status3::NETWORKLOSS_LAST_STATE,
            FailSafe::Zero => artnet::status3::NETWORKLOSS_OFF_STATE,
            FailSafe::Full => artnet::status3::NETWORKLOSS_ON_STATE,
            FailSafe::PlaybackScene | FailSafe::RecordScene => artnet::status3::NETWORKLOSS_PLAYBACK,
        }
    }

    fn send_diag(&mut self, priority: u8, text: &str) {
        if !self.diag.send || priority < self.diag.priority {
            return;
        }
        let packet = artnet::ArtDiagData { priority, text: text.to_string() };
        let destination = self.diag.ip;
        self.queue(packet.to_bytes(), destination);
    }

    // --- DMX / Sync ---

    fn handle_dmx(&mut self, dmx: &artnet::ArtDmx, from: Ipv4Addr, now: u32) {
        for port in 0..PORTS {
            if self.direction[port] != PortDir::Output
                || self.outputs[port].protocol != PortProtocol::ArtNet
                || self.outputs[port].port_address != dmx.port_address
            {
                continue;
            }

            if self.outputs[port].merge.is_merging() && !self.disable_merge_timeout {
                if self.outputs[port].merge.sweep(now) {
                    self.is_changed = true;
                    self.send_diag(artnet::diag_priority::LOW, "Leaving merge mode");
                }
            }

            let was_merging = self.outputs[port].merge.is_merging();

            match self.outputs[port]
                .merge
                .ingest(from, None, dmx.sequence, &dmx.data, now)
            {
                crate::network::merge::Ingest::Dropped => continue,
                crate::network::merge::Ingest::Merged if !was_merging => {
                    self.is_changed = true;
                    self.send_diag(artnet::diag_priority::LOW, "Merging data");
                }
                _ => {}
            }

            self.last_dmx_millis = now;
            self.dmx_seen = true;
            self.network_loss_fired = false;

            if self.is_synchronous {
                // Buffer until the ArtSync arrives
                let frame = self.outputs[port].merge.merged().to_vec();
                self.outputs[port].data_pending = true;
                self.lightset.set_data(port, &frame, false);
            } else {
                let frame = self.outputs[port].merge.merged().to_vec();
                self.lightset.set_data(port, &frame, true);

                if let Some(store) = self.frame_store.as_ref() {
                    store.update(dmx.port_address, &frame);
                }

                if !self.outputs[port].is_transmitting {
                    self.lightset.start(port);
                    self.outputs[port].is_transmitting = true;
                    self.is_changed = true;
                }
            }
        }
    }

    fn handle_sync(&mut self, now: u32) {
        self.is_synchronous = true;
        self.sync_millis = now;

        for port in 0..PORTS {
            if self.direction[port] != PortDir::Output
                || self.outputs[port].protocol != PortProtocol::ArtNet
            {
                continue;
            }

            if self.outputs[port].merge.length() > 0 {
                let frame = self.outputs[port].merge.merged().to_vec();
                self.lightset.set_data(port, &frame, true);

                if !self.outputs[port].is_transmitting {
                    self.lightset.start(port);
                    self.outputs[port].is_transmitting = true;
                    self.is_changed = true;
                }

                self.outputs[port].data_pending = false;
                self.outputs[port].merge.clear_length();
            }
        }
    }

    fn set_network_data_loss(&mut self) {
        self.network_loss_fired = true;
        self.dmx_seen = false;
        self.is_synchronous = false;
        self.is_changed = true;

        let mut do_failsafe = false;

        for port in 0..PORTS {
            if self.outputs[port].protocol != PortProtocol::ArtNet {
                continue;
            }
            if self.outputs[port].is_transmitting {
                do_failsafe = true;
                self.outputs[port].is_transmitting = false;
            }
            self.outputs[port].merge.cancel();
            self.outputs[port].merge.clear_length();
        }

        if do_failsafe {
            log::info!("network data loss, applying failsafe {:?}", self.failsafe);
            self.send_diag(artnet::diag_priority::HIGH, "Network data loss");
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
                // No scene storage attached; behave like Hold
                log::warn!("failsafe scene not supported, holding last state");
            }
        }
    }

    // --- Address programming ---

    fn handle_address(&mut self, address: &artnet::ArtAddress, now: u32) {
        let page = if address.bind_index > 0 {
            (address.bind_index - 1) as usize
        } else {
            0
        };
        if page >= PORTS {
            return;
        }

        self.report_code = artnet::report_code::POWER_OK;

        if !address.short_name.is_empty() {
            self.short_names[page] = address.short_name.clone();
            self.report_code = artnet::report_code::SHORT_NAME_OK;
        }

        if !address.long_name.is_empty() {
            self.long_name = address.long_name.clone();
            self.report_code = artnet::report_code::LONG_NAME_OK;
        }

        if address.sub_switch == program::DEFAULTS {
            self.set_sub_switch(page, 0);
        } else if address.sub_switch & program::CHANGE_MASK != 0 {
            self.set_sub_switch(page, address.sub_switch & !program::CHANGE_MASK);
        }

        if address.net_switch == program::DEFAULTS {
            self.set_net_switch(page, 0);
        } else if address.net_switch & program::CHANGE_MASK != 0 {
            self.set_net_switch(page, address.net_switch & !program::CHANGE_MASK);
        }

        if address.sw_out[0] != program::NO_CHANGE && self.direction[page] == PortDir::Output {
            if address.sw_out[0] == program::DEFAULTS {
                self.set_universe_switch(page, PortDir::Output, 1);
            } else if address.sw_out[0] & program::CHANGE_MASK != 0 {
                self.set_universe_switch(page, PortDir::Output, address.sw_out[0] & !program::CHANGE_MASK);
            }
        }

        if address.sw_in[0] != program::NO_CHANGE && self.direction[page] == PortDir::Input {
            if address.sw_in[0] == program::DEFAULTS {
                self.set_universe_switch(page, PortDir::Input, 1);
            } else if address.sw_in[0] & program::CHANGE_MASK != 0 {
                self.set_universe_switch(page, PortDir::Input, address.sw_in[0] & !program::CHANGE_MASK);
            }
        }

        self.handle_port_command(address.command);

        self.is_changed = true;
        self.queue_poll_reply(now, self.host.broadcast_ip(), 0x7fff, 0);
    }

    fn handle_port_command(&mut self, command: u8) {
        use artnet::port_command as cmd;

        let port = (command & 0x03) as usize;

        match command {
            cmd::NONE => {}
            cmd::CANCEL => {
                for output in self.outputs.iter_mut() {
                    output.merge.cancel();
                }
                self.set_local_merging();
            }
            cmd::LED_NORMAL => {
                self.status1 = (self.status1 & !artnet::status1::INDICATOR_MASK)
                    | artnet::status1::INDICATOR_NORMAL_MODE;
            }
            cmd::LED_MUTE => {
                self.status1 = (self.status1 & !artnet::status1::INDICATOR_MASK)
                    | artnet::status1::INDICATOR_MUTE_MODE;
            }
            cmd::LED_LOCATE => {
                self.status1 = (self.status1 & !artnet::status1::INDICATOR_MASK)
                    | artnet::status1::INDICATOR_LOCATE_MODE;
            }
            cmd::RESET => {
                for input in self.inputs.iter_mut() {
                    input.good_input &= !artnet::good_input::ERRORS;
                }
            }
            cmd::FAIL_HOLD => self.failsafe = FailSafe::Hold,
            cmd::FAIL_ZERO => self.failsafe = FailSafe::Zero,
            cmd::FAIL_FULL => self.failsafe = FailSafe::Full,
            cmd::FAIL_SCENE => self.failsafe = FailSafe::PlaybackScene,
            cmd::FAIL_RECORD => self.failsafe = FailSafe::RecordScene,
            _ if command & !0x03 == cmd::MERGE_LTP_BASE => {
                self.outputs[port].merge.set_merge_mode(MergeMode::Ltp);
            }
            _ if command & !0x03 == cmd::MERGE_HTP_BASE => {
                self.outputs[port].merge.set_merge_mode(MergeMode::Htp);
            }
            _ if command & !0x03 == cmd::ARTNET_SEL_BASE => {
                self.outputs[port].protocol = PortProtocol::ArtNet;
                self.set_local_merging();
            }
            _ if command & !0x03 == cmd::ACN_SEL_BASE => {
                self.outputs[port].protocol = PortProtocol::Sacn;
                self.set_local_merging();
            }
            _ if command & !0x03 == cmd::CLEAR_BASE => {
                if self.direction[port] == PortDir::Output
                    && self.outputs[port].protocol == PortProtocol::ArtNet
                {
                    self.outputs[port].merge.clear_output();
                    let frame = self.outputs[port].merge.merged().to_vec();
                    self.lightset.set_data(port, &frame, true);
                }
            }
            _ if command & !0x03 == cmd::STYLE_DELTA_BASE => {
                self.outputs[port].output_style = OutputStyle::Delta;
                self.lightset.set_output_style(port, OutputStyle::Delta);
            }
            _ if command & !0x03 == cmd::STYLE_CONSTANT_BASE => {
                self.outputs[port].output_style = OutputStyle::Constant;
                self.lightset.set_output_style(port, OutputStyle::Constant);
            }
            _ if command & !0x03 == cmd::RDM_ENABLE_BASE => {
                self.outputs[port].rdm_enabled = true;
            }
            _ if command & !0x03 == cmd::RDM_DISABLE_BASE => {
                self.outputs[port].rdm_enabled = false;
            }
            _ => {
                // Unknown command: ignore but leave a trace in the report
                self.report_code = artnet::report_code::PARSE_FAIL;
            }
        }
    }

    fn set_sub_switch(&mut self, port: usize, sub: u8) {
        let current = PortAddress::from(self.outputs[port].port_address);
        let updated = PortAddress::compose(current.net(), sub, current.universe()).value();
        self.outputs[port].port_address = updated;
        self.inputs[port].port_address = updated;
        self.set_local_merging();
    }

    fn set_net_switch(&mut self, port: usize, net: u8) {
        let current = PortAddress::from(self.outputs[port].port_address);
        let updated = PortAddress::compose(net, current.sub_net(), current.universe()).value();
        self.outputs[port].port_address = updated;
        self.inputs[port].port_address = updated;
        self.set_local_merging();
    }

    fn set_universe_switch(&mut self, port: usize, dir: PortDir, universe: u8) {
        let current = PortAddress::from(self.outputs[port].port_address);
        let updated = PortAddress::compose(current.net(), current.sub_net(), universe);

        match dir {
            PortDir::Output => {
                self.outputs[port].port_address = updated.value();
                self.outputs[port].default_address = universe & 0x0f;
            }
            PortDir::Input => {
                self.inputs[port].port_address = updated.value();
                self.inputs[port].default_address = universe & 0x0f;
            }
            PortDir::Disabled => {}
        }
        self.set_local_merging();
    }

    /// When a local input shares a Port-Address and protocol with a local
    /// output, the input loops back into the output's merger as a
    /// synthetic source under the local IP.
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

                if self.inputs[input_index].port_address == self.outputs[output_index].port_address
                    && self.outputs[output_index].protocol == PortProtocol::ArtNet
                {
                    if self.outputs[output_index].merge.slot_of(local_ip, None).is_none() {
                        self.outputs[output_index].merge.bind_local(local_ip);
                    }
                    self.inputs[input_index].local_merge = true;
                    self.outputs[output_index].local_merge = true;
                }
            }
        }
    }

    // --- Input ports ---

    fn handle_input(&mut self, input: &artnet::ArtInput) {
        let page = if input.bind_index > 0 {
            (input.bind_index - 1) as usize
        } else {
            0
        };

        for offset in 0..4usize {
            let port = page + offset;
            if port >= PORTS || self.direction[port] != PortDir::Input {
                continue;
            }

            let disabled = input.input[offset] & 0x01 != 0;
            self.inputs[port].disabled_by_controller = disabled;
            if disabled {
                self.inputs[port].good_input |= artnet::good_input::DISABLED;
            } else {
                self.inputs[port].good_input &= !artnet::good_input::DISABLED;
            }
        }

        self.is_changed = true;
    }

    fn handle_dmx_in(&mut self, now: u32) {
        let mut dmx = match self.dmx.take() {
            Some(dmx) => dmx,
            None => return,
        };

        for port in 0..PORTS {
            if self.direction[port] != PortDir::Input || self.inputs[port].disabled_by_controller {
                continue;
            }

            if let Some(frame) = dmx.read(port) {
                let mut data = frame.data;
                if data.len() % 2 == 1 {
                    data.push(0x00);
                }

                self.inputs[port].good_input |= artnet::good_input::DATA_RECEIVED;
                self.inputs[port].last_frame = data.clone();
                self.inputs[port].last_send_millis = now;
                self.send_dmx_in(port, data, now);
                continue;
            }

            if dmx.updates_per_second(port) == 0 {
                // The wire went quiet: one final frame, then 1 Hz keepalive
                let had_data =
                    self.inputs[port].good_input & artnet::good_input::DATA_RECEIVED != 0;

                let due = now.wrapping_sub(self.inputs[port].last_send_millis)
                    >= INPUT_KEEPALIVE_MILLIS;

                if (had_data || due) && !self.inputs[port].last_frame.is_empty() {
                    self.inputs[port].good_input &= !artnet::good_input::DATA_RECEIVED;
                    self.inputs[port].last_send_millis = now;
                    let data = self.inputs[port].last_frame.clone();
                    self.send_dmx_in(port, data, now);
                }
            }
        }

        self.dmx = Some(dmx);
    }

    fn send_dmx_in(&mut self, port: usize, data: Vec<u8>, now: u32) {
        // 1..=255, never 0
        let sequence = self.inputs[port].sequence % 255 + 1;
        self.inputs[port].sequence = sequence;

        let dmx = artnet::ArtDmx {
            sequence,
            physical: port as u8,
            port_address: self.inputs[port].port_address,
            data,
        };

        let destination = if self.inputs[port].destination_ip.is_unspecified() {
            self.host.broadcast_ip()
        } else {
            self.inputs[port].destination_ip
        };

        self.queue(dmx.to_bytes(), destination);

        if self.inputs[port].local_merge {
            let local_ip = self.host.local_ip();
            self.handle_dmx(&dmx, local_ip, now);
        }
    }

    // --- RDM ---

    fn handle_tod_request(&mut self, request: &artnet::ArtTodRequest) {
        for address in request.addresses.clone() {
            let port_address = ((request.net as u16) << 8) | address as u16;
            for port in 0..PORTS {
                if self.rdm_target(port, port_address) {
                    self.send_tod(port);
                }
            }
        }
    }

    fn handle_tod_control(&mut self, control: &artnet::ArtTodControl) {
        let port_address = ((control.net as u16) << 8) | control.address as u16;

        for port in 0..PORTS {
            if !self.rdm_target(port, port_address) {
                continue;
            }

            let gated = self.rdm_gate_start(port);

            if control.command == artnet::tod_control::FLUSH {
                if let Some(rdm) = self.rdm.as_mut() {
                    rdm.full_discovery(port);
                }
            }

            self.send_tod(port);
            self.rdm_gate_end(port, gated);
        }
    }

    fn handle_rdm(&mut self, rdm: &artnet::ArtRdm, from: Ipv4Addr) {
        let port_address = ((rdm.net as u16) << 8) | rdm.address as u16;

        for port in 0..PORTS {
            if !self.rdm_target(port, port_address) {
                continue;
            }

            let gated = self.rdm_gate_start(port);

            let response = self
                .rdm
                .as_mut()
                .and_then(|provider| provider.handle(port, &rdm.data));

            if let Some(response) = response {
                let reply = artnet::ArtRdm {
                    rdm_version: 0x01,
                    net: rdm.net,
                    command: rdm.command,
                    address: rdm.address,
                    data: response,
                };
                self.queue(reply.to_bytes(), from);
            }

            self.rdm_gate_end(port, gated);
        }
    }

    fn rdm_target(&self, port: usize, port_address: u16) -> bool {
        self.rdm.is_some()
            && self.direction[port] == PortDir::Output
            && self.outputs[port].rdm_enabled
            && self.outputs[port].port_address == port_address
    }

    /// Pause DMX on the port for the duration of an RDM transaction.
    /// Returns whether output was actually paused.
    fn rdm_gate_start(&mut self, port: usize) -> bool {
        if self.rdm_is_responder {
            return false;
        }

        let transmitting = if self.outputs[port].protocol == PortProtocol::Sacn {
            // Protocol-switched port: the sACN bridge owns the output
            self.sacn_status
                .as_ref()
                .map(|status| status.is_active(port))
                .unwrap_or(false)
        } else {
            self.outputs[port].is_transmitting
        };

        if transmitting {
            self.lightset.stop(port);
        }
        transmitting
    }

    fn rdm_gate_end(&mut self, port: usize, gated: bool) {
        if gated {
            self.lightset.start(port);
        }
    }

    fn send_tod(&mut self, port: usize) {
        let provider = match self.rdm.as_mut() {
            Some(provider) => provider,
            None => return,
        };

        let total = provider.uid_count(port);
        let mut uids = vec![0u8; total * UID_SIZE];
        let copied = provider.copy_uids(port, &mut uids);
        uids.truncate(copied * UID_SIZE);

        let port_address = self.outputs[port].port_address;
        let blocks: Vec<Vec<[u8; UID_SIZE]>> = uids
            .chunks(UID_SIZE)
            .map(|chunk| {
                let mut uid = [0u8; UID_SIZE];
                uid.copy_from_slice(chunk);
                uid
            })
            .collect::<Vec<_>>()
            .chunks(TOD_BLOCK_SIZE)
            .map(|block| block.to_vec())
            .collect();

        let broadcast = self.host.broadcast_ip();

        if blocks.is_empty() {
            let tod = artnet::ArtTodData {
                rdm_version: 0x01,
                port: (1 + (port & 0x03)) as u8,
                bind_index: (port + 1) as u8,
                net: (port_address >> 8) as u8 & 0x7f,
                command_response: 0,
                address: (port_address & 0xff) as u8,
                uid_total: 0,
                block_count: 0,
                uids: Vec::new(),
            };
            self.queue(tod.to_bytes(), broadcast);
            return;
        }

        for (block_index, block) in blocks.into_iter().enumerate() {
            let tod = artnet::ArtTodData {
                rdm_version: 0x01,
                port: (1 + (port & 0x03)) as u8,
                bind_index: (port + 1) as u8,
                net: (port_address >> 8) as u8 & 0x7f,
                command_response: 0,
                address: (port_address & 0xff) as u8,
                uid_total: copied as u16,
                block_count: block_index as u8,
                uids: block,
            };
            self.queue(tod.to_bytes(), broadcast);
        }
    }

    // --- Trigger / IpProg ---

    fn handle_trigger(&mut self, trigger: &artnet::ArtTrigger) {
        if trigger.oem == 0xffff || trigger.oem == self.oem {
            if let Some(sink) = self.trigger.as_mut() {
                sink.on_trigger(trigger.key, trigger.sub_key, &trigger.payload);
            }
        }
    }

    fn handle_ip_prog(&mut self, prog: &artnet::ArtIpProg, from: Ipv4Addr) {
        use artnet::ip_prog_command as cmd;

        if prog.command & cmd::ENABLE_PROGRAMMING != 0 {
            if prog.command & cmd::ENABLE_DHCP != 0 {
                if !self.host.enable_dhcp() {
                    self.report_code = artnet::report_code::PARSE_FAIL;
                }
            }
            if prog.command & cmd::SET_DEFAULT != 0 {
                if !self.host.set_ip(Ipv4Addr::UNSPECIFIED) {
                    self.report_code = artnet::report_code::PARSE_FAIL;
                }
            }
            if prog.command & cmd::PROGRAM_IP != 0 {
                if !self.host.set_ip(Ipv4Addr::from(prog.ip)) {
                    self.report_code = artnet::report_code::PARSE_FAIL;
                }
            }
            if prog.command & cmd::PROGRAM_NETMASK != 0 {
                if !self.host.set_netmask(Ipv4Addr::from(prog.netmask)) {
                    self.report_code = artnet::report_code::PARSE_FAIL;
                }
            }
        }

        let reply = artnet::ArtIpProgReply {
            ip: self.host.local_ip().octets(),
            netmask: self.host.netmask().octets(),
            port: artnet::ARTNET_PORT,
            status: if self.host.is_dhcp() { 1 << 6 } else { 0 },
            gateway: self.host.gateway_ip().octets(),
        };
        self.queue(reply.to_bytes(), from);
    }
}
