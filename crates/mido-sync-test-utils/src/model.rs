//! Desired-state model builder
//!
//! Panics on references to undeclared VPCs or groups; it is test-only.

use crate::config::TEST_NODE;
use crate::names::test_mac;
use mido_sync_common::gni::{
    GlobalNetworkInfo, GniInterface, GniNatGateway, GniRouteEntry, GniRouteTable, GniRule,
    GniSecurityGroup, GniSubnet, GniVpc,
};
use std::net::Ipv4Addr;

/// Builder for [`GlobalNetworkInfo`]
///
/// # Example
///
/// ```
/// use mido_sync_test_utils::model::ModelBuilder;
///
/// let gni = ModelBuilder::new()
///     .vpc("vpc-1", "10.0.0.0/16")
///     .subnet("vpc-1", "subnet-1", "10.0.1.0/24")
///     .build();
/// assert_eq!(gni.vpcs[0].subnets.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    gni: GlobalNetworkInfo,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing model
    pub fn from_model(gni: GlobalNetworkInfo) -> Self {
        Self { gni }
    }

    fn vpc_mut(&mut self, vpc: &str) -> &mut GniVpc {
        self.gni
            .vpcs
            .iter_mut()
            .find(|v| v.name == vpc)
            .unwrap_or_else(|| panic!("vpc {vpc} not declared"))
    }

    pub fn vpc(mut self, name: &str, cidr: &str) -> Self {
        self.gni.vpcs.push(GniVpc {
            name: name.to_string(),
            cidr: cidr.to_string(),
            internet_gateways: Vec::new(),
            subnets: Vec::new(),
            route_tables: Vec::new(),
            nat_gateways: Vec::new(),
        });
        self
    }

    pub fn subnet(mut self, vpc: &str, name: &str, cidr: &str) -> Self {
        self.vpc_mut(vpc).subnets.push(GniSubnet {
            name: name.to_string(),
            cidr: cidr.to_string(),
            route_table: None,
        });
        self
    }

    pub fn internet_gateway(mut self, vpc: &str, name: &str) -> Self {
        self.vpc_mut(vpc).internet_gateways.push(name.to_string());
        self
    }

    /// Declare a route table from `(destination, target)` pairs
    pub fn route_table(mut self, vpc: &str, name: &str, entries: &[(&str, &str)]) -> Self {
        self.vpc_mut(vpc).route_tables.push(GniRouteTable {
            name: name.to_string(),
            entries: entries
                .iter()
                .map(|(destination, target)| GniRouteEntry {
                    destination: destination.to_string(),
                    target: target.to_string(),
                })
                .collect(),
        });
        self
    }

    /// Associate a route table with a subnet
    pub fn associate(mut self, vpc: &str, subnet: &str, table: &str) -> Self {
        let subnet = self
            .vpc_mut(vpc)
            .subnets
            .iter_mut()
            .find(|s| s.name == subnet)
            .unwrap_or_else(|| panic!("subnet {subnet} not declared"));
        subnet.route_table = Some(table.to_string());
        self
    }

    pub fn nat_gateway(
        mut self,
        vpc: &str,
        subnet: &str,
        name: &str,
        private_ip: Ipv4Addr,
        public_ip: Ipv4Addr,
    ) -> Self {
        let n = self.gni.vpcs.iter().map(|v| v.nat_gateways.len()).sum::<usize>() as u32;
        self.vpc_mut(vpc).nat_gateways.push(GniNatGateway {
            name: name.to_string(),
            subnet: subnet.to_string(),
            mac: test_mac(0x00ff_0000 + n),
            private_ip,
            public_ip,
        });
        self
    }

    pub fn security_group(mut self, name: &str) -> Self {
        self.gni.security_groups.push(GniSecurityGroup {
            name: name.to_string(),
            ingress_rules: Vec::new(),
            egress_rules: Vec::new(),
        });
        self
    }

    fn group_mut(&mut self, group: &str) -> &mut GniSecurityGroup {
        self.gni
            .security_groups
            .iter_mut()
            .find(|g| g.name == group)
            .unwrap_or_else(|| panic!("security group {group} not declared"))
    }

    pub fn ingress(mut self, group: &str, rule: GniRule) -> Self {
        self.group_mut(group).ingress_rules.push(rule);
        self
    }

    pub fn egress(mut self, group: &str, rule: GniRule) -> Self {
        self.group_mut(group).egress_rules.push(rule);
        self
    }

    pub fn interface(mut self, iface: GniInterface) -> Self {
        self.gni.interfaces.push(iface);
        self
    }

    /// Drop a security group by name
    pub fn without_security_group(mut self, name: &str) -> Self {
        self.gni.security_groups.retain(|g| g.name != name);
        for iface in &mut self.gni.interfaces {
            iface.security_groups.retain(|g| g != name);
        }
        self
    }

    pub fn build(self) -> GlobalNetworkInfo {
        self.gni
    }
}

/// Interface `n` on [`TEST_NODE`], no public address, no groups
pub fn interface(n: u32, vpc: &str, subnet: &str, private_ip: Ipv4Addr) -> GniInterface {
    GniInterface {
        name: format!("eni-{n:08x}"),
        instance_id: format!("i-{n:08x}"),
        vpc: vpc.to_string(),
        subnet: subnet.to_string(),
        mac: test_mac(n),
        private_ip,
        public_ip: None,
        node: TEST_NODE.to_string(),
        security_groups: Vec::new(),
        src_dst_check: true,
    }
}

/// Allow TCP `port` from `cidr`
pub fn tcp_rule(port: i32, cidr: &str) -> GniRule {
    GniRule {
        protocol: 6,
        from_port: Some(port),
        to_port: Some(port),
        icmp_type: None,
        icmp_code: None,
        cidrs: vec![cidr.to_string()],
        groups: Vec::new(),
    }
}

/// Allow every protocol from members of `group`
pub fn group_rule(group: &str) -> GniRule {
    GniRule {
        protocol: -1,
        from_port: None,
        to_port: None,
        icmp_type: None,
        icmp_code: None,
        cidrs: Vec::new(),
        groups: vec![group.to_string()],
    }
}
