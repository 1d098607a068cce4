//! Desired-state network model ("global network info")
//!
//! Produced by the cloud controller and consumed read-only. Addresses that
//! the controller may get wrong (CIDRs, rule peers) are kept as strings so a
//! bad entry can be skipped without rejecting the whole document.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Whole desired state for one reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalNetworkInfo {
    #[serde(default)]
    pub vpcs: Vec<GniVpc>,
    #[serde(default)]
    pub security_groups: Vec<GniSecurityGroup>,
    #[serde(default)]
    pub interfaces: Vec<GniInterface>,
    /// Domain handed out by DHCP
    #[serde(default)]
    pub instance_dns_domain: Option<String>,
    /// DNS servers handed out by DHCP
    #[serde(default)]
    pub instance_dns_servers: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GniVpc {
    pub name: String,
    pub cidr: String,
    /// Attached internet gateways (`igw-…`)
    #[serde(default)]
    pub internet_gateways: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<GniSubnet>,
    #[serde(default)]
    pub route_tables: Vec<GniRouteTable>,
    #[serde(default)]
    pub nat_gateways: Vec<GniNatGateway>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GniSubnet {
    pub name: String,
    pub cidr: String,
    /// Associated route table; subnets without one get no routes
    #[serde(default)]
    pub route_table: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GniRouteTable {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<GniRouteEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GniRouteEntry {
    pub destination: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GniNatGateway {
    pub name: String,
    pub subnet: String,
    pub mac: String,
    pub private_ip: Ipv4Addr,
    pub public_ip: Ipv4Addr,
}

/// One instance network interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GniInterface {
    /// Interface name (`eni-…`)
    pub name: String,
    /// Owning instance (`i-…`)
    pub instance_id: String,
    pub vpc: String,
    pub subnet: String,
    pub mac: String,
    pub private_ip: Ipv4Addr,
    #[serde(default)]
    pub public_ip: Option<Ipv4Addr>,
    /// Host the instance runs on, as registered with the backend
    pub node: String,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default = "default_true")]
    pub src_dst_check: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GniSecurityGroup {
    pub name: String,
    #[serde(default)]
    pub ingress_rules: Vec<GniRule>,
    #[serde(default)]
    pub egress_rules: Vec<GniRule>,
}

/// One security-group rule; each CIDR or group peer becomes one filter rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GniRule {
    /// IP protocol number, `-1` for all
    pub protocol: i32,
    #[serde(default)]
    pub from_port: Option<i32>,
    #[serde(default)]
    pub to_port: Option<i32>,
    #[serde(default)]
    pub icmp_type: Option<i32>,
    #[serde(default)]
    pub icmp_code: Option<i32>,
    #[serde(default)]
    pub cidrs: Vec<String>,
    /// Peer security-group names
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl GlobalNetworkInfo {
    /// Parse a model document
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn find_vpc(&self, name: &str) -> Option<&GniVpc> {
        self.vpcs.iter().find(|v| v.name == name)
    }

    pub fn find_security_group(&self, name: &str) -> Option<&GniSecurityGroup> {
        self.security_groups.iter().find(|g| g.name == name)
    }

    pub fn find_interface(&self, name: &str) -> Option<&GniInterface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Interfaces placed in a given subnet of a given VPC
    pub fn interfaces_in<'a>(
        &'a self,
        vpc: &'a str,
        subnet: &'a str,
    ) -> impl Iterator<Item = &'a GniInterface> + 'a {
        self.interfaces
            .iter()
            .filter(move |i| i.vpc == vpc && i.subnet == subnet)
    }

    /// Interfaces that are members of a security group
    pub fn members_of<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a GniInterface> + 'a {
        self.interfaces
            .iter()
            .filter(move |i| i.security_groups.iter().any(|g| g == group))
    }

    /// Look up a NAT gateway anywhere in the model, with its VPC
    pub fn find_nat_gateway(&self, name: &str) -> Option<(&GniVpc, &GniNatGateway)> {
        self.vpcs.iter().find_map(|vpc| {
            vpc.nat_gateways
                .iter()
                .find(|n| n.name == name)
                .map(|n| (vpc, n))
        })
    }
}

impl GniVpc {
    pub fn find_subnet(&self, name: &str) -> Option<&GniSubnet> {
        self.subnets.iter().find(|s| s.name == name)
    }

    pub fn find_route_table(&self, name: &str) -> Option<&GniRouteTable> {
        self.route_tables.iter().find(|t| t.name == name)
    }

    pub fn nat_gateways_in<'a>(
        &'a self,
        subnet: &'a str,
    ) -> impl Iterator<Item = &'a GniNatGateway> + 'a {
        self.nat_gateways.iter().filter(move |n| n.subnet == subnet)
    }

    pub fn has_internet_gateway(&self, name: &str) -> bool {
        self.internet_gateways.iter().any(|g| g == name)
    }
}
