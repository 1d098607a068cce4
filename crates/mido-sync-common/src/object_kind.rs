//! Backend object kinds and cleanup ordering
//!
//! Provides consistent cleanup priority across all deletion paths.
//! Objects must be removed leaf-first so that nothing is left referencing
//! an object that is already gone.

use serde::{Deserialize, Serialize};

/// Kinds of objects on the network-virtualization backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Virtual router
    Router,
    /// Virtual L2 bridge
    Bridge,
    /// Port on a router or bridge
    Port,
    /// Filter chain
    Chain,
    /// Rule inside a filter chain
    Rule,
    /// Named address group
    IpAddrGroup,
    /// One address inside an address group
    IpAddrGroupAddr,
    /// Route entry on a router
    Route,
    /// DHCP configuration on a bridge
    DhcpSubnet,
    /// Static DHCP host entry
    DhcpHost,
    /// Port group
    PortGroup,
    /// Port group membership
    PortGroupPort,
    /// Binding of a port to a host interface
    HostBinding,
    /// Physical host registered with the backend (never created by mido-sync)
    Host,
}

impl ObjectKind {
    /// Every kind, in listing order
    pub const ALL: &'static [ObjectKind] = &[
        ObjectKind::Router,
        ObjectKind::Bridge,
        ObjectKind::Port,
        ObjectKind::Chain,
        ObjectKind::Rule,
        ObjectKind::IpAddrGroup,
        ObjectKind::IpAddrGroupAddr,
        ObjectKind::Route,
        ObjectKind::DhcpSubnet,
        ObjectKind::DhcpHost,
        ObjectKind::PortGroup,
        ObjectKind::PortGroupPort,
        ObjectKind::HostBinding,
        ObjectKind::Host,
    ];

    /// Get cleanup priority (lower number = cleanup first)
    ///
    /// - 0: host bindings, port group memberships, DHCP hosts, group addresses
    /// - 1: rules and routes
    /// - 2: DHCP subnets
    /// - 3: ports
    /// - 4: routers and bridges
    /// - 5: chains, address groups and port groups
    ///
    /// Routers and bridges reference chains as filters, so chains go last.
    pub fn cleanup_priority(self) -> u8 {
        match self {
            ObjectKind::HostBinding
            | ObjectKind::PortGroupPort
            | ObjectKind::DhcpHost
            | ObjectKind::IpAddrGroupAddr => 0,
            ObjectKind::Rule | ObjectKind::Route => 1,
            ObjectKind::DhcpSubnet => 2,
            ObjectKind::Port => 3,
            ObjectKind::Router | ObjectKind::Bridge => 4,
            ObjectKind::Chain | ObjectKind::IpAddrGroup | ObjectKind::PortGroup => 5,
            ObjectKind::Host => u8::MAX,
        }
    }

    /// Stable lowercase name, also used as the REST collection name
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Router => "router",
            ObjectKind::Bridge => "bridge",
            ObjectKind::Port => "port",
            ObjectKind::Chain => "chain",
            ObjectKind::Rule => "rule",
            ObjectKind::IpAddrGroup => "ip_addr_group",
            ObjectKind::IpAddrGroupAddr => "ip_addr_group_addr",
            ObjectKind::Route => "route",
            ObjectKind::DhcpSubnet => "dhcp_subnet",
            ObjectKind::DhcpHost => "dhcp_host",
            ObjectKind::PortGroup => "port_group",
            ObjectKind::PortGroupPort => "port_group_port",
            ObjectKind::HostBinding => "host_binding",
            ObjectKind::Host => "host",
        }
    }

    /// Whether mido-sync ever creates or deletes objects of this kind
    pub fn is_managed(self) -> bool {
        self != ObjectKind::Host
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
