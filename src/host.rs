// Host capabilities - clock, network identity and the few programmable
// settings the ArtIpProg machinery may touch

use std::net::Ipv4Addr;
use std::time::Instant;

/// Everything the engines need from the machine they run on.
///
/// The setters back the ArtIpProg command; a host that cannot reprogram
/// its interface (the common case on a desktop) keeps the refusing
/// defaults and the node reports the command as ignored.
pub trait Host {
    /// Monotonic milliseconds. Wraps after ~49 days, which every consumer
    /// handles with wrapping subtraction.
    fn now_millis(&self) -> u32;

    fn mac(&self) -> [u8; 6];
    fn local_ip(&self) -> Ipv4Addr;
    fn broadcast_ip(&self) -> Ipv4Addr;
    fn netmask(&self) -> Ipv4Addr;
    fn gateway_ip(&self) -> Ipv4Addr;
    fn is_dhcp(&self) -> bool;

    /// The stable 16-byte component identifier used as the sACN CID.
    fn cid(&self) -> [u8; 16];

    fn set_ip(&mut self, _ip: Ipv4Addr) -> bool {
        false
    }

    fn set_netmask(&mut self, _netmask: Ipv4Addr) -> bool {
        false
    }

    fn enable_dhcp(&mut self) -> bool {
        false
    }
}

/// Receives ArtTrigger macros whose OEM code matches (or is the wildcard).
pub trait TriggerSink {
    fn on_trigger(&mut self, key: u8, sub_key: u8, payload: &[u8]);
}

/// A decoded ArtTimeCode frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeCode {
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    /// 0 = Film (24fps), 1 = EBU (25fps), 2 = DF (29.97fps), 3 = SMPTE (30fps)
    pub kind: u8,
}

/// Receives network time code
pub trait TimeCodeSink {
    fn on_time_code(&mut self, time_code: TimeCode);
}

/// Default host backed by the OS: interface lookup through
/// `local-ip-address`, a freshly minted v4 UUID as the CID, and a
/// process-relative monotonic clock.
pub struct SystemHost {
    started: Instant,
    local_ip: Ipv4Addr,
    netmask: Ipv4Addr,
    cid: [u8; 16],
}

impl SystemHost {
    pub fn new() -> Self {
        let local_ip = match local_ip_address::local_ip() {
            Ok(std::net::IpAddr::V4(ip)) => ip,
            _ => Ipv4Addr::UNSPECIFIED,
        };

        Self {
            started: Instant::now(),
            local_ip,
            // A /24 is the sensible guess when the OS will not tell us
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            cid: *uuid::Uuid::new_v4().as_bytes(),
        }
    }

    /// Use a persisted CID instead of a random one, so the sACN identity
    /// survives restarts.
    pub fn with_cid(mut self, cid: [u8; 16]) -> Self {
        self.cid = cid;
        self
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for SystemHost {
    fn now_millis(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    fn mac(&self) -> [u8; 6] {
        // Derive a locally administered MAC from the IP when the real one
        // is not available through the host platform.
        let octets = self.local_ip.octets();
        [0x02, 0x00, octets[0], octets[1], octets[2], octets[3]]
    }

    fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn broadcast_ip(&self) -> Ipv4Addr {
        let ip = u32::from(self.local_ip);
        let mask = u32::from(self.netmask);
        Ipv4Addr::from(ip | !mask)
    }

    fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    fn gateway_ip(&self) -> Ipv4Addr {
        let ip = u32::from(self.local_ip);
        let mask = u32::from(self.netmask);
        if ip == 0 {
            return Ipv4Addr::UNSPECIFIED;
        }
        Ipv4Addr::from((ip & mask) | 1)
    }

    fn is_dhcp(&self) -> bool {
        false
    }

    fn cid(&self) -> [u8; 16] {
        self.cid
    }
}
