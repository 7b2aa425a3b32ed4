// DmxPort - the serial DMX512 UART driver boundary

use crate::lightset::PortDir;

/// One frame read from a local DMX input, start code already stripped.
#[derive(Debug, Clone)]
pub struct DmxInput {
    pub data: Vec<u8>,
    /// Refresh rate the transmitter is running at; 0 means the input
    /// has gone quiet.
    pub updates_per_second: u32,
}

/// The serial DMX512 driver. Wire timing (break, MAB, slots) lives behind
/// this boundary; the engines only move whole universes through it.
///
/// `read` must not block: it returns `None` when no changed frame is
/// pending on that port.
pub trait DmxPort {
    fn open(&mut self, port: usize, dir: PortDir);
    fn read(&mut self, port: usize) -> Option<DmxInput>;
    /// Refresh rate of the transmitter currently seen on an input port,
    /// 0 when the line is quiet.
    fn updates_per_second(&mut self, port: usize) -> u32;
    fn write(&mut self, port: usize, data: &[u8]);
    fn close(&mut self, port: usize);
}
