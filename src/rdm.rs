// RdmProvider - the RDM responder/transceiver boundary

/// An RDM UID is 48 bits: 16-bit manufacturer + 32-bit device id
pub const UID_SIZE: usize = 6;

/// UIDs per ArtTodData block; larger tables page with `BlockCount`
pub const TOD_BLOCK_SIZE: usize = 200;

/// The RDM transceiver attached to the local DMX ports. Discovery and
/// request handling happen on the far side of this boundary; the node
/// only relays packets and the table of devices.
pub trait RdmProvider {
    /// Number of UIDs currently in the port's table of devices
    fn uid_count(&mut self, port: usize) -> usize;

    /// Copy the TOD into `out` (6 bytes per UID); returns the number of
    /// UIDs written, bounded by the buffer.
    fn copy_uids(&mut self, port: usize, out: &mut [u8]) -> usize;

    /// Flush the TOD and run full discovery on the port
    fn full_discovery(&mut self, port: usize);

    /// Forward one RDM request (sub-start-code onwards, checksum included)
    /// to the port and return the response, if the target answered.
    fn handle(&mut self, port: usize, request: &[u8]) -> Option<Vec<u8>>;
}
