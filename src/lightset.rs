// LightSet - the local DMX512 output/input abstraction the engines drive

use serde::{Deserialize, Serialize};

/// A full DMX512 universe is 512 slots
pub const UNIVERSE_SIZE: usize = 512;

/// Highest DMX slot value
pub const DMX_MAX_VALUE: u8 = 255;

/// Direction of a local port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDir {
    Disabled,
    Input,
    Output,
}

/// Which network protocol feeds or drains a local port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    ArtNet,
    #[serde(rename = "sACN")]
    Sacn,
}

/// Two-source merge policy for an output port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    Htp,
    Ltp,
}

/// How the driver paces frames onto the DMX wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStyle {
    /// Frames go out only when the data changes
    Delta,
    /// Frames are retransmitted continuously
    Constant,
}

/// What an output does when network data is lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailSafe {
    /// Hold the last received state (default)
    Hold,
    /// All slots to zero
    Zero,
    /// All slots to full
    Full,
    /// Play back a recorded failsafe scene
    PlaybackScene,
    /// Record the current output as the failsafe scene
    RecordScene,
}

impl Default for FailSafe {
    fn default() -> Self {
        FailSafe::Hold
    }
}

/// The sink the merge engine drains into: a pixel driver, a DMX UART,
/// a visualiser. One instance serves all local ports.
///
/// `set_data` with `push = false` stages a frame for a later `sync`;
/// with `push = true` the frame goes straight to the output.
pub trait LightSet {
    fn set_data(&mut self, port: usize, data: &[u8], push: bool);
    fn start(&mut self, port: usize);
    fn stop(&mut self, port: usize);
    fn sync(&mut self, port: usize);
    fn blackout(&mut self, on: bool);
    fn set_output_style(&mut self, port: usize, style: OutputStyle);
}
