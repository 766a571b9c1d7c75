use std::net::Ipv4Addr;

use getset::Getters;
use ipnetwork::Ipv4Network;

use crate::config::NODE_SHORT_ID_LEN;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The interface name of the veth peer inside the sandbox namespace.
pub const NAMESPACE_VETH_NAME: &str = "eth0";

/// The tap device name inside the sandbox namespace.
pub const TAP_NAME: &str = "tap0";

/// The fixed in-namespace sandbox address (SNAT/DNAT target).
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 21);

/// The fixed tap device address.
pub const TAP_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 22);

/// The prefix length of the tap device network.
pub const TAP_PREFIX: u8 = 30;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One reserved IP/interface bundle on one worker node.
///
/// Everything network-related about a sandbox derives deterministically from
/// `slot_index`; nothing here is stored beyond the KV reservation entry.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Slot {
    /// The reserved index, in `0..=255`.
    slot_index: u8,

    /// First eight characters of the owning node's id.
    node_short_id: String,

    /// The owning sandbox's session id.
    session_id: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Slot {
    /// Creates a slot record for a reserved index.
    pub fn new(slot_index: u8, node_id: &str, session_id: impl Into<String>) -> Self {
        Self {
            slot_index,
            node_short_id: node_short_id(node_id),
            session_id: session_id.into(),
        }
    }

    /// The KV key guarding this slot's reservation.
    pub fn kv_key(&self) -> String {
        format!("{}/{}", self.node_short_id, self.slot_index)
    }

    /// The name of the sandbox's network namespace.
    pub fn netns_name(&self) -> String {
        format!("ns-{}", self.slot_index)
    }

    /// The host-side veth interface name.
    pub fn veth_name(&self) -> String {
        format!("veth-{}", self.slot_index)
    }

    /// The host end of the veth pair: `10.0.{slot}.1/24`.
    pub fn veth_host_cidr(&self) -> Ipv4Network {
        Ipv4Network::new(Ipv4Addr::new(10, 0, self.slot_index, 1), 24)
            .expect("prefix 24 is always valid")
    }

    /// The namespace end of the veth pair: `10.0.{slot}.2/24`.
    pub fn veth_peer_cidr(&self) -> Ipv4Network {
        Ipv4Network::new(Ipv4Addr::new(10, 0, self.slot_index, 2), 24)
            .expect("prefix 24 is always valid")
    }

    /// The host-visible sandbox address: `192.168.{slot}.1/32`.
    pub fn host_ip_cidr(&self) -> Ipv4Network {
        Ipv4Network::new(Ipv4Addr::new(192, 168, self.slot_index, 1), 32)
            .expect("prefix 32 is always valid")
    }

    /// The fixed in-namespace sandbox address.
    pub fn guest_ip(&self) -> Ipv4Addr {
        GUEST_IP
    }

    /// The tap device network: `169.254.0.22/30`.
    pub fn tap_cidr(&self) -> Ipv4Network {
        Ipv4Network::new(TAP_IP, TAP_PREFIX).expect("prefix 30 is always valid")
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Shortens a node id to the prefix used in KV keys and session records.
pub fn node_short_id(node_id: &str) -> String {
    node_id.chars().take(NODE_SHORT_ID_LEN).collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivations_are_deterministic() {
        for index in [0u8, 42, 255] {
            let a = Slot::new(index, "node-1234-abcd", "session-a");
            let b = Slot::new(index, "node-1234-abcd", "session-a");

            assert_eq!(a.kv_key(), b.kv_key());
            assert_eq!(a.netns_name(), b.netns_name());
            assert_eq!(a.veth_name(), b.veth_name());
            assert_eq!(a.veth_host_cidr(), b.veth_host_cidr());
            assert_eq!(a.veth_peer_cidr(), b.veth_peer_cidr());
            assert_eq!(a.host_ip_cidr(), b.host_ip_cidr());
            assert_eq!(a.tap_cidr(), b.tap_cidr());
        }
    }

    #[test]
    fn test_derived_addresses() {
        let slot = Slot::new(42, "node-1234-abcd", "session-a");

        assert_eq!(slot.netns_name(), "ns-42");
        assert_eq!(slot.veth_name(), "veth-42");
        assert_eq!(slot.veth_host_cidr().to_string(), "10.0.42.1/24");
        assert_eq!(slot.veth_peer_cidr().to_string(), "10.0.42.2/24");
        assert_eq!(slot.host_ip_cidr().to_string(), "192.168.42.1/32");
        assert_eq!(slot.guest_ip().to_string(), "169.254.0.21");
        assert_eq!(slot.tap_cidr().to_string(), "169.254.0.22/30");
        assert_eq!(slot.kv_key(), "node-123/42");
    }

    #[test]
    fn test_node_short_id_truncates() {
        assert_eq!(node_short_id("abcdefgh1234"), "abcdefgh");
        assert_eq!(node_short_id("abc"), "abc");
    }
}
