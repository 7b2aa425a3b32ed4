// Network module for the Art-Net and sACN protocol engines

pub mod artnet;
pub mod bridge;
pub mod controller;
pub mod merge;
pub mod node;
pub mod poll_table;
pub mod port_address;
pub mod sacn;
pub mod sacn_controller;
pub mod socket;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;
