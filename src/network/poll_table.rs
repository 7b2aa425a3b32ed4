// Controller-side table of discovered Art-Net nodes
//
// The primary table is kept sorted by IPv4 (compared in network order) so
// insert and lookup are binary searches. A derived index maps each
// universe to the IPs contributing to it; the controller consults it to
// decide between unicast and broadcast. Cleanup is incremental: one
// (node, universe) slot per tick, so a full table never stalls the loop.

use serde::Serialize;
use std::net::Ipv4Addr;

use crate::network::artnet::{self, ArtPollReply, POLL_INTERVAL_MILLIS};
use crate::network::port_address::PortAddress;

/// Table bounds
pub const TABLE_SIZE: usize = 255;
pub const NODE_UNIVERSES: usize = 64;
pub const TABLE_UNIVERSES: usize = 512;

/// A universe slot expires after missing roughly one and a half polls
pub const UNIVERSE_EXPIRY_MILLIS: u32 = POLL_INTERVAL_MILLIS + POLL_INTERVAL_MILLIS / 2;

/// One output universe advertised by a node
#[derive(Debug, Clone, Serialize)]
pub struct UniverseEntry {
    pub universe: u16,
    pub short_name: String,
    pub last_update_millis: u32,
}

/// One discovered node
#[derive(Debug, Clone, Serialize)]
pub struct NodeEntry {
    pub ip: Ipv4Addr,
    pub mac: [u8; 6],
    pub long_name: String,
    pub universes: Vec<UniverseEntry>,
}

#[derive(Debug, Clone)]
struct UniverseSubscribers {
    universe: u16,
    ips: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Default)]
struct CleanCursor {
    node: usize,
    universe: usize,
    offline: bool,
}

/// The poll table
pub struct PollTable {
    nodes: Vec<NodeEntry>,
    universes: Vec<UniverseSubscribers>,
    cursor: CleanCursor,
}

impl PollTable {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            universes: Vec::new(),
            cursor: CleanCursor { offline: true, ..CleanCursor::default() },
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeEntry] {
        &self.nodes
    }

    /// IPs currently outputting the universe
    pub fn subscribers(&self, universe: u16) -> Option<&[Ipv4Addr]> {
        self.universes
            .iter()
            .find(|entry| entry.universe == universe)
            .map(|entry| entry.ips.as_slice())
    }

    /// Fold one ArtPollReply into the table.
    pub fn add(&mut self, reply: &ArtPollReply, now_millis: u32) {
        let ip = Ipv4Addr::from(reply.ip_address);
        let key = u32::from(ip);

        let index = match self.nodes.binary_search_by_key(&key, |node| u32::from(node.ip)) {
            Ok(index) => index,
            Err(insert_at) => {
                if self.nodes.len() == TABLE_SIZE {
                    log::debug!("poll table full, dropping reply from {}", ip);
                    return;
                }
                self.nodes.insert(
                    insert_at,
                    NodeEntry {
                        ip,
                        mac: [0; 6],
                        long_name: String::new(),
                        universes: Vec::new(),
                    },
                );
                insert_at
            }
        };

        // Identity fields come from the root bound device only
        if reply.bind_index <= 1 {
            self.nodes[index].mac = reply.mac_address;
            self.nodes[index].long_name = reply.long_name.clone();
        }

        for port in 0..4 {
            if reply.port_types[port] & artnet::port_type::OUTPUT_ARTNET == 0 {
                continue;
            }

            let universe =
                PortAddress::compose(reply.net_switch, reply.sub_switch, reply.sw_out[port]).value();

            let node = &mut self.nodes[index];
            let slot = node.universes.iter().position(|u| u.universe == universe);

            let slot = match slot {
                Some(slot) => slot,
                None => {
                    if node.universes.len() == NODE_UNIVERSES {
                        continue;
                    }
                    node.universes.push(UniverseEntry {
                        universe,
                        short_name: reply.short_name.clone(),
                        last_update_millis: 0,
                    });
                    self.index_add(ip, universe);
                    self.nodes[index].universes.len() - 1
                }
            };

            self.nodes[index].universes[slot].last_update_millis = now_millis;
        }
    }

    fn index_add(&mut self, ip: Ipv4Addr, universe: u16) {
        match self.universes.iter_mut().find(|entry| entry.universe == universe) {
            Some(entry) => {
                if !entry.ips.contains(&ip) && entry.ips.len() < TABLE_SIZE {
                    entry.ips.push(ip);
                }
            }
            None => {
                if self.universes.len() < TABLE_UNIVERSES {
                    self.universes.push(UniverseSubscribers { universe, ips: vec![ip] });
                }
            }
        }
    }

    fn index_remove(&mut self, ip: Ipv4Addr, universe: u16) {
        if let Some(position) = self.universes.iter().position(|entry| entry.universe == universe) {
            let entry = &mut self.universes[position];
            entry.ips.retain(|&candidate| candidate != ip);
            if entry.ips.is_empty() {
                self.universes.remove(position);
            }
        }
    }

    /// One incremental cleanup step: examine a single (node, universe)
    /// slot and expire it when it has missed ~1.5 poll intervals. A node
    /// whose slots have all expired is dropped.
    pub fn clean(&mut self, now_millis: u32) {
        if self.nodes.is_empty() {
            self.cursor = CleanCursor { offline: true, ..CleanCursor::default() };
            return;
        }

        if self.cursor.node >= self.nodes.len() {
            self.cursor = CleanCursor { offline: true, ..CleanCursor::default() };
        }

        if self.cursor.universe == 0 {
            self.cursor.offline = true;
        }

        let node_index = self.cursor.node;

        if self.cursor.universe < self.nodes[node_index].universes.len() {
            let entry = &mut self.nodes[node_index].universes[self.cursor.universe];

            if now_millis.wrapping_sub(entry.last_update_millis) > UNIVERSE_EXPIRY_MILLIS {
                let universe = entry.universe;
                let ip = self.nodes[node_index].ip;
                self.nodes[node_index].universes.remove(self.cursor.universe);
                self.index_remove(ip, universe);
                // The next entry shifted into this slot; revisit it
            } else {
                self.cursor.offline = false;
                self.cursor.universe += 1;
            }
            return;
        }

        // Finished this node's slots
        if self.cursor.offline {
            let node = self.nodes.remove(node_index);
            log::debug!("node {} went off-line", node.ip);
            for entry in &node.universes {
                self.index_remove(node.ip, entry.universe);
            }
        } else {
            self.cursor.node += 1;
        }

        self.cursor.universe = 0;
        self.cursor.offline = true;

        if self.cursor.node >= self.nodes.len() {
            self.cursor.node = 0;
        }
    }

    /// The table rendered for the status surface.
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "entries": self.nodes.len(),
            "nodes": self.nodes,
        })
    }
}

impl Default for PollTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::artnet::port_type;
    use rand::{Rng, SeedableRng};

    fn reply(ip: [u8; 4], net: u8, sub: u8, sw_out: u8) -> ArtPollReply {
        ArtPollReply {
            ip_address: ip,
            net_switch: net,
            sub_switch: sub,
            short_name: "node".into(),
            long_name: format!("node at {}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]),
            num_ports: 1,
            port_types: [port_type::OUTPUT_ARTNET, 0, 0, 0],
            sw_out: [sw_out, 0, 0, 0],
            bind_index: 1,
            ..ArtPollReply::default()
        }
    }

    fn assert_sorted(table: &PollTable) {
        let keys: Vec<u32> = table.nodes().iter().map(|n| u32::from(n.ip)).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn add_keeps_the_table_sorted_by_network_order_ip() {
        let mut table = PollTable::new();
        table.add(&reply([10, 0, 0, 9], 0, 0, 1), 0);
        table.add(&reply([10, 0, 0, 2], 0, 0, 1), 0);
        table.add(&reply([192, 168, 1, 1], 0, 0, 1), 0);
        table.add(&reply([10, 0, 0, 5], 0, 0, 1), 0);

        assert_eq!(table.len(), 4);
        assert_sorted(&table);
    }

    #[test]
    fn re_adding_a_node_updates_instead_of_duplicating() {
        let mut table = PollTable::new();
        table.add(&reply([10, 0, 0, 2], 0, 0, 1), 0);
        table.add(&reply([10, 0, 0, 2], 0, 0, 1), 100);
        table.add(&reply([10, 0, 0, 2], 0, 0, 2), 200);

        assert_eq!(table.len(), 1);
        assert_eq!(table.nodes()[0].universes.len(), 2);
    }

    #[test]
    fn subscribers_reflect_contributing_nodes() {
        let mut table = PollTable::new();
        table.add(&reply([10, 0, 0, 2], 0, 0, 1), 0);
        table.add(&reply([10, 0, 0, 3], 0, 0, 1), 0);

        let universe = PortAddress::compose(0, 0, 1).value();
        let subscribers = table.subscribers(universe).unwrap();
        assert_eq!(subscribers.len(), 2);
        assert!(subscribers.contains(&Ipv4Addr::new(10, 0, 0, 2)));
        assert!(subscribers.contains(&Ipv4Addr::new(10, 0, 0, 3)));

        assert!(table.subscribers(0x7fff).is_none());
    }

    #[test]
    fn expired_universes_and_nodes_are_cleaned_incrementally() {
        let mut table = PollTable::new();
        table.add(&reply([10, 0, 0, 2], 0, 0, 1), 0);
        let universe = PortAddress::compose(0, 0, 1).value();

        // Within the expiry nothing changes no matter how often we tick
        for _ in 0..16 {
            table.clean(UNIVERSE_EXPIRY_MILLIS);
        }
        assert_eq!(table.len(), 1);

        // After the expiry the universe goes, then the node
        for _ in 0..16 {
            table.clean(UNIVERSE_EXPIRY_MILLIS + 1);
        }
        assert_eq!(table.len(), 0);
        assert!(table.subscribers(universe).is_none());
    }

    #[test]
    fn a_fresh_universe_keeps_its_node_alive() {
        let mut table = PollTable::new();
        table.add(&reply([10, 0, 0, 2], 0, 0, 1), 0);
        table.add(&reply([10, 0, 0, 2], 0, 0, 1), 10_000);

        for _ in 0..16 {
            table.clean(13_000); // universe refreshed at t=10s
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn table_is_bounded_to_255_nodes() {
        let mut table = PollTable::new();
        for a in 0..=255u8 {
            for b in 0..2u8 {
                table.add(&reply([10, 0, b, a], 0, 0, 1), 0);
            }
        }
        assert_eq!(table.len(), TABLE_SIZE);
        assert_sorted(&table);
    }

    #[test]
    fn fuzz_inserts_keep_every_invariant() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x1936);
        let mut table = PollTable::new();

        for _ in 0..10_000 {
            let ip = [10, rng.gen_range(0..4), rng.gen_range(0..32), rng.gen_range(0..64)];
            let net = rng.gen_range(0..4);
            let sub = rng.gen_range(0..4);
            let sw_out = rng.gen_range(0..16);
            table.add(&reply(ip, net, sub, sw_out), 0);
        }

        assert!(table.len() <= TABLE_SIZE);
        assert_sorted(&table);

        // Binary search finds every inserted IP
        for node in table.nodes() {
            let key = u32::from(node.ip);
            assert!(table
                .nodes()
                .binary_search_by_key(&key, |n| u32::from(n.ip))
                .is_ok());
        }

        // Reverse index consistency: every contributor appears in the
        // primary table with a matching universe entry
        for entry in &table.universes {
            for ip in &entry.ips {
                let node = table.nodes().iter().find(|n| n.ip == *ip).expect("indexed ip in table");
                assert!(node.universes.iter().any(|u| u.universe == entry.universe));
            }
        }
    }
}
