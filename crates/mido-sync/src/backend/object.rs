//! Backend object representation
//!
//! A deliberately small model of what the network-virtualization API
//! exposes: every object has an id, a name, tags, and a kind-specific spec
//! whose fields reference other objects by id.

use ipnetwork::Ipv4Network;
use mido_sync_common::ObjectKind;
use mido_sync_common::tags::{self, ObjectIdentity, TAG_KEY, TAG_OWNER, TAG_SLOT, Tags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Backend-assigned object identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An object as stored on the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidoObject {
    pub id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub tags: Tags,
    pub spec: ObjectSpec,
}

/// An object to be created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObject {
    pub name: String,
    #[serde(default)]
    pub tags: Tags,
    pub spec: ObjectSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectSpec {
    Router {
        #[serde(default)]
        inbound_filter: Option<ObjectId>,
        #[serde(default)]
        outbound_filter: Option<ObjectId>,
    },
    Bridge {
        #[serde(default)]
        inbound_filter: Option<ObjectId>,
    },
    Port(PortSpec),
    Chain,
    Rule(RuleSpec),
    IpAddrGroup,
    IpAddrGroupAddr {
        group: ObjectId,
        addr: Ipv4Addr,
    },
    Route(RouteSpec),
    DhcpSubnet(DhcpSubnetSpec),
    DhcpHost {
        dhcp: ObjectId,
        mac: String,
        addr: Ipv4Addr,
        hostname: String,
    },
    PortGroup,
    PortGroupPort {
        group: ObjectId,
        port: ObjectId,
    },
    HostBinding {
        host: ObjectId,
        port: ObjectId,
        interface: String,
    },
    Host {
        #[serde(default)]
        addresses: Vec<Ipv4Addr>,
    },
}

/// Router or bridge port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Owning router or bridge
    pub device: ObjectId,
    /// Router ports carry an address; bridge ports do not
    #[serde(default)]
    pub address: Option<Ipv4Network>,
    #[serde(default)]
    pub mac: Option<String>,
    /// Linked port; only the port created second records the link
    #[serde(default)]
    pub peer: Option<ObjectId>,
    #[serde(default)]
    pub inbound_filter: Option<ObjectId>,
    #[serde(default)]
    pub outbound_filter: Option<ObjectId>,
}

/// Route entry on a router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub router: ObjectId,
    pub src: Ipv4Network,
    pub dst: Ipv4Network,
    pub next_hop_port: ObjectId,
    #[serde(default)]
    pub next_hop_gateway: Option<Ipv4Addr>,
    pub weight: u32,
}

/// DHCP configuration served on a bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhcpSubnetSpec {
    pub bridge: ObjectId,
    pub subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Filter rule at an explicit position in a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub chain: ObjectId,
    pub position: u32,
    pub action: RuleAction,
    #[serde(default)]
    pub matches: RuleMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Accept,
    Drop,
    Return,
    Jump { target: ObjectId },
    Dnat { to: Ipv4Addr },
    Snat { to: Ipv4Addr },
    RevDnat,
    RevSnat,
}

/// Match conditions; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleMatch {
    pub nw_proto: Option<u8>,
    pub nw_src: Option<Ipv4Network>,
    pub inv_nw_src: bool,
    pub nw_dst: Option<Ipv4Network>,
    pub inv_nw_dst: bool,
    pub ip_addr_group_src: Option<ObjectId>,
    pub ip_addr_group_dst: Option<ObjectId>,
    pub tp_dst: Option<PortRange>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
    pub match_return_flow: bool,
    pub dl_src: Option<String>,
    pub inv_dl_src: bool,
}

/// Inclusive transport port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl ObjectSpec {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectSpec::Router { .. } => ObjectKind::Router,
            ObjectSpec::Bridge { .. } => ObjectKind::Bridge,
            ObjectSpec::Port(_) => ObjectKind::Port,
            ObjectSpec::Chain => ObjectKind::Chain,
            ObjectSpec::Rule(_) => ObjectKind::Rule,
            ObjectSpec::IpAddrGroup => ObjectKind::IpAddrGroup,
            ObjectSpec::IpAddrGroupAddr { .. } => ObjectKind::IpAddrGroupAddr,
            ObjectSpec::Route(_) => ObjectKind::Route,
            ObjectSpec::DhcpSubnet(_) => ObjectKind::DhcpSubnet,
            ObjectSpec::DhcpHost { .. } => ObjectKind::DhcpHost,
            ObjectSpec::PortGroup => ObjectKind::PortGroup,
            ObjectSpec::PortGroupPort { .. } => ObjectKind::PortGroupPort,
            ObjectSpec::HostBinding { .. } => ObjectKind::HostBinding,
            ObjectSpec::Host { .. } => ObjectKind::Host,
        }
    }

    /// Every object id this spec points at
    pub fn references(&self) -> Vec<&ObjectId> {
        let mut refs = Vec::new();
        match self {
            ObjectSpec::Router {
                inbound_filter,
                outbound_filter,
            } => {
                refs.extend(inbound_filter);
                refs.extend(outbound_filter);
            }
            ObjectSpec::Bridge { inbound_filter } => refs.extend(inbound_filter),
            ObjectSpec::Port(port) => {
                refs.push(&port.device);
                refs.extend(&port.peer);
                refs.extend(&port.inbound_filter);
                refs.extend(&port.outbound_filter);
            }
            ObjectSpec::Rule(rule) => {
                refs.push(&rule.chain);
                if let RuleAction::Jump { target } = &rule.action {
                    refs.push(target);
                }
                refs.extend(&rule.matches.ip_addr_group_src);
                refs.extend(&rule.matches.ip_addr_group_dst);
            }
            ObjectSpec::IpAddrGroupAddr { group, .. } => refs.push(group),
            ObjectSpec::Route(route) => {
                refs.push(&route.router);
                refs.push(&route.next_hop_port);
            }
            ObjectSpec::DhcpSubnet(dhcp) => refs.push(&dhcp.bridge),
            ObjectSpec::DhcpHost { dhcp, .. } => refs.push(dhcp),
            ObjectSpec::PortGroupPort { group, port } => {
                refs.push(group);
                refs.push(port);
            }
            ObjectSpec::HostBinding { host, port, .. } => {
                refs.push(host);
                refs.push(port);
            }
            ObjectSpec::Chain
            | ObjectSpec::IpAddrGroup
            | ObjectSpec::PortGroup
            | ObjectSpec::Host { .. } => {}
        }
        refs
    }
}

impl MidoObject {
    pub fn kind(&self) -> ObjectKind {
        self.spec.kind()
    }

    pub fn references(&self) -> Vec<&ObjectId> {
        self.spec.references()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn owner(&self) -> Option<&str> {
        self.tag(TAG_OWNER)
    }

    pub fn slot(&self) -> Option<&str> {
        self.tag(TAG_SLOT)
    }

    pub fn key(&self) -> Option<&str> {
        self.tag(TAG_KEY)
    }

    pub fn is_managed(&self) -> bool {
        tags::is_managed(&self.tags)
    }

    pub fn identity(&self) -> Option<ObjectIdentity> {
        tags::identity(&self.tags)
    }

    pub fn as_port(&self) -> Option<&PortSpec> {
        match &self.spec {
            ObjectSpec::Port(port) => Some(port),
            _ => None,
        }
    }

    pub fn as_rule(&self) -> Option<&RuleSpec> {
        match &self.spec {
            ObjectSpec::Rule(rule) => Some(rule),
            _ => None,
        }
    }
}

impl NewObject {
    pub fn kind(&self) -> ObjectKind {
        self.spec.kind()
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    /// Whether an existing object already satisfies this one.
    ///
    /// Tags are not compared; they carry creation timestamps.
    pub fn matches(&self, existing: &MidoObject) -> bool {
        self.name == existing.name && self.spec == existing.spec
    }
}

impl RuleSpec {
    pub fn new(chain: ObjectId, position: u32, action: RuleAction) -> Self {
        Self {
            chain,
            position,
            action,
            matches: RuleMatch::default(),
        }
    }

    pub fn with_match(mut self, matches: RuleMatch) -> Self {
        self.matches = matches;
        self
    }

    pub fn jump_target(&self) -> Option<&ObjectId> {
        match &self.action {
            RuleAction::Jump { target } => Some(target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(device: &str, peer: Option<&str>) -> ObjectSpec {
        ObjectSpec::Port(PortSpec {
            device: device.into(),
            peer: peer.map(ObjectId::from),
            ..Default::default()
        })
    }

    #[test]
    fn test_kind_matches_spec() {
        assert_eq!(ObjectSpec::Chain.kind(), ObjectKind::Chain);
        assert_eq!(port("router-1", None).kind(), ObjectKind::Port);
    }

    #[test]
    fn test_port_references_device_and_peer() {
        let spec = port("router-1", Some("port-9"));
        let refs: Vec<_> = spec.references().into_iter().map(|r| r.as_str()).collect();
        assert_eq!(refs, vec!["router-1", "port-9"]);
    }

    #[test]
    fn test_rule_references_jump_and_groups() {
        let rule = RuleSpec::new("chain-1".into(), 0, RuleAction::Jump {
            target: "chain-2".into(),
        })
        .with_match(RuleMatch {
            ip_addr_group_src: Some("iag-1".into()),
            ..Default::default()
        });
        let spec = ObjectSpec::Rule(rule);
        let refs: Vec<_> = spec.references().into_iter().map(|r| r.as_str()).collect();
        assert_eq!(refs, vec!["chain-1", "chain-2", "iag-1"]);
    }

    #[test]
    fn test_matches_ignores_tags() {
        let new = NewObject {
            name: "eucart".to_string(),
            tags: Tags::from([("a".to_string(), "1".to_string())]),
            spec: ObjectSpec::Router {
                inbound_filter: None,
                outbound_filter: None,
            },
        };
        let existing = MidoObject {
            id: "router-000001".into(),
            name: "eucart".to_string(),
            tags: Tags::new(),
            spec: new.spec.clone(),
        };
        assert!(new.matches(&existing));

        let renamed = MidoObject {
            name: "other".to_string(),
            ..existing
        };
        assert!(!new.matches(&renamed));
    }

    #[test]
    fn test_json_shape() {
        let obj = MidoObject {
            id: "chain-000001".into(),
            name: "vc_vpc-1_prechain".to_string(),
            tags: Tags::new(),
            spec: ObjectSpec::Chain,
        };
        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json["id"], "chain-000001");
        assert_eq!(json["spec"]["kind"], "chain");

        let back: MidoObject = serde_json::from_value(json).unwrap();
        assert_eq!(back, obj);
    }
}
