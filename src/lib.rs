// lxnode - Universal Art-Net/sACN node and controller engine
//
// The protocol state machines live in `network`; the traits at the crate
// root are the seams where hardware (DMX UARTs, pixel drivers, RDM
// transceivers, the host clock and identity) plugs in. Each engine is a
// single long-lived value that owns its UDP socket and all of its state;
// `run()` drives the cooperative loop on one tokio task.

pub mod dmx;
pub mod error;
pub mod host;
pub mod lightset;
pub mod network;
pub mod rdm;

pub use dmx::{DmxInput, DmxPort};
pub use error::{Error, Result};
pub use host::{Host, SystemHost, TimeCode, TimeCodeSink, TriggerSink};
pub use lightset::{FailSafe, LightSet, MergeMode, OutputStyle, PortDir, PortProtocol};
pub use network::artnet;
pub use network::bridge::{SacnBridge, SacnBridgeConfig, SacnPortConfig, SacnStatus, SacnStatusHandle};
pub use network::controller::{ArtController, ArtControllerConfig};
pub use network::merge::MergeEngine;
pub use network::node::{ArtNode, ArtNodeConfig, PortConfig};
pub use network::poll_table::PollTable;
pub use network::port_address::PortAddress;
pub use network::sacn;
pub use network::sacn_controller::{SacnController, SacnControllerConfig};
pub use network::store::{FrameStore, FrameStoreHandle};
pub use rdm::RdmProvider;

/// Number of local DMX ports compiled into the engines. Multi-port
/// gateway builds switch to 32 with the `multi-port` feature.
#[cfg(not(feature = "multi-port"))]
pub const PORTS: usize = 4;

#[cfg(feature = "multi-port")]
pub const PORTS: usize = 32;
