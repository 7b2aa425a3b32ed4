// Shared test doubles for the engine tests

use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::dmx::{DmxInput, DmxPort};
use crate::host::Host;
use crate::lightset::{LightSet, OutputStyle, PortDir};
use crate::rdm::RdmProvider;

/// A host with a hand-cranked clock and fixed identity
pub struct FakeHost {
    pub millis: AtomicU32,
    pub local_ip: Ipv4Addr,
    pub cid: [u8; 16],
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            millis: AtomicU32::new(0),
            local_ip: Ipv4Addr::new(192, 168, 1, 10),
            cid: [0x42; 16],
        }
    }

    pub fn advance(&self, millis: u32) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Host for FakeHost {
    fn now_millis(&self) -> u32 {
        self.millis.load(Ordering::SeqCst)
    }

    fn mac(&self) -> [u8; 6] {
        [0x02, 0x00, 0xc0, 0xa8, 0x01, 0x0a]
    }

    fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn broadcast_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, 255)
    }

    fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    fn gateway_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, 1)
    }

    fn is_dhcp(&self) -> bool {
        false
    }

    fn cid(&self) -> [u8; 16] {
        self.cid
    }
}

/// A `Host` handle over a shared `FakeHost`, so tests keep a clock they
/// can advance while the engine owns its host box.
pub struct SharedHost(pub Arc<FakeHost>);

impl Host for SharedHost {
    fn now_millis(&self) -> u32 {
        self.0.now_millis()
    }

    fn mac(&self) -> [u8; 6] {
        self.0.mac()
    }

    fn local_ip(&self) -> Ipv4Addr {
        self.0.local_ip()
    }

    fn broadcast_ip(&self) -> Ipv4Addr {
        self.0.broadcast_ip()
    }

    fn netmask(&self) -> Ipv4Addr {
        self.0.netmask()
    }

    fn gateway_ip(&self) -> Ipv4Addr {
        self.0.gateway_ip()
    }

    fn is_dhcp(&self) -> bool {
        self.0.is_dhcp()
    }

    fn cid(&self) -> [u8; 16] {
        self.0.cid()
    }
}

/// Every LightSet call, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LightSetCall {
    SetData { port: usize, data: Vec<u8>, push: bool },
    Start(usize),
    Stop(usize),
    Sync(usize),
    Blackout(bool),
    SetOutputStyle(usize, OutputStyle),
}

/// Records everything the engine drives into it
#[derive(Clone, Default)]
pub struct MockLightSet {
    pub calls: Arc<Mutex<Vec<LightSetCall>>>,
}

impl MockLightSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<LightSetCall> {
        self.calls.lock().clone()
    }

    pub fn set_data_calls(&self) -> Vec<LightSetCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, LightSetCall::SetData { .. }))
            .cloned()
            .collect()
    }

    pub fn last_frame(&self, port: usize) -> Option<Vec<u8>> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            LightSetCall::SetData { port: p, data, .. } if *p == port => Some(data.clone()),
            _ => None,
        })
    }
}

impl LightSet for MockLightSet {
    fn set_data(&mut self, port: usize, data: &[u8], push: bool) {
        self.calls.lock().push(LightSetCall::SetData {
            port,
            data: data.to_vec(),
            push,
        });
    }

    fn start(&mut self, port: usize) {
        self.calls.lock().push(LightSetCall::Start(port));
    }

    fn stop(&mut self, port: usize) {
        self.calls.lock().push(LightSetCall::Stop(port));
    }

    fn sync(&mut self, port: usize) {
        self.calls.lock().push(LightSetCall::Sync(port));
    }

    fn blackout(&mut self, on: bool) {
        self.calls.lock().push(LightSetCall::Blackout(on));
    }

    fn set_output_style(&mut self, port: usize, style: OutputStyle) {
        self.calls.lock().push(LightSetCall::SetOutputStyle(port, style));
    }
}

/// A DMX driver whose inputs the test scripts by hand
#[derive(Clone, Default)]
pub struct MockDmxPort {
    pub pending: Arc<Mutex<Vec<(usize, DmxInput)>>>,
    pub written: Arc<Mutex<Vec<(usize, Vec<u8>)>>>,
}

impl MockDmxPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_input(&self, port: usize, data: Vec<u8>, updates_per_second: u32) {
        self.pending.lock().push((
            port,
            DmxInput {
                data,
                updates_per_second,
            },
        ));
    }
}

impl DmxPort for MockDmxPort {
    fn open(&mut self, _port: usize, _dir: PortDir) {}

    fn read(&mut self, port: usize) -> Option<DmxInput> {
        let mut pending = self.pending.lock();
        let position = pending.iter().position(|(p, _)| *p == port)?;
        Some(pending.remove(position).1)
    }

    fn updates_per_second(&mut self, _port: usize) -> u32 {
        40
    }

    fn write(&mut self, port: usize, data: &[u8]) {
        self.written.lock().push((port, data.to_vec()));
    }

    fn close(&mut self, _port: usize) {}
}

/// An RDM provider with a fixed TOD and echo responses
#[derive(Clone)]
pub struct MockRdmProvider {
    pub uids: Arc<Mutex<Vec<[u8; 6]>>>,
    pub discoveries: Arc<Mutex<u32>>,
    pub response: Option<Vec<u8>>,
}

impl MockRdmProvider {
    pub fn new(uids: Vec<[u8; 6]>) -> Self {
        Self {
            uids: Arc::new(Mutex::new(uids)),
            discoveries: Arc::new(Mutex::new(0)),
            response: Some(vec![0x01, 0xcc, 0x03, 0x00]),
        }
    }
}

impl RdmProvider for MockRdmProvider {
    fn uid_count(&mut self, _port: usize) -> usize {
        self.uids.lock().len()
    }

    fn copy_uids(&mut self, _port: usize, out: &mut [u8]) -> usize {
        let uids = self.uids.lock();
        let count = uids.len().min(out.len() / 6);
        for (index, uid) in uids.iter().take(count).enumerate() {
            out[index * 6..index * 6 + 6].copy_from_slice(uid);
        }
        count
    }

    fn full_discovery(&mut self, _port: usize) {
        *self.discoveries.lock() += 1;
    }

    fn handle(&mut self, _port: usize, _request: &[u8]) -> Option<Vec<u8>> {
        self.response.clone()
    }
}
