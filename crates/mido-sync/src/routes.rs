//! Route-table translation
//!
//! Route tables are re-parsed on every pass; only resolvable entries become
//! backend routes. Everything else is skipped with a warning.

use crate::backend::ObjectId;
use crate::error::{SyncError, SyncResult};
use ipnetwork::Ipv4Network;
use mido_sync_common::cidr::parse_network;
use mido_sync_common::gni::{GlobalNetworkInfo, GniRouteTable, GniVpc};
use mido_sync_common::{RouteTarget, classify_route_target};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// One usable route-table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRoute {
    pub destination: Ipv4Network,
    pub target: RouteTarget,
    /// Target identifier as written in the model (`igw-…`, `nat-…`, `eni-…`)
    pub target_name: String,
}

/// Parse a route table, dropping entries the backend cannot realize.
///
/// Fails only when more than `max_routes` usable entries remain.
pub fn parse_route_table(table: &GniRouteTable, max_routes: usize) -> SyncResult<Vec<ParsedRoute>> {
    let mut routes = Vec::new();
    for entry in &table.entries {
        let target = classify_route_target(&entry.target);
        match target {
            RouteTarget::Local => {
                debug!(table = %table.name, destination = %entry.destination, "Skipping local route");
                continue;
            }
            RouteTarget::VirtualPrivateGateway | RouteTarget::Peering => {
                warn!(
                    table = %table.name,
                    target = %entry.target,
                    kind = target.as_str(),
                    "Route target not supported by the backend, skipping"
                );
                continue;
            }
            RouteTarget::Invalid => {
                warn!(table = %table.name, target = %entry.target, "Invalid route target, skipping");
                continue;
            }
            RouteTarget::InternetGateway | RouteTarget::Eni | RouteTarget::NatGateway => {}
        }

        let destination = match parse_network(&entry.destination) {
            Ok(destination) => destination,
            Err(e) => {
                warn!(table = %table.name, error = %e, "Malformed route destination, skipping");
                continue;
            }
        };

        routes.push(ParsedRoute {
            destination,
            target,
            target_name: entry.target.clone(),
        });
    }

    if routes.len() > max_routes {
        return Err(SyncError::CapacityExceeded {
            what: format!("routes in table {}", table.name),
            max: max_routes,
        });
    }
    Ok(routes)
}

/// Next hop of a backend route on the VPC router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHop {
    pub port: ObjectId,
    pub gateway: Option<Ipv4Addr>,
}

/// Ports a VPC router can forward through
#[derive(Debug, Clone, Default)]
pub struct VpcHops {
    /// VPC router uplink towards the global router
    pub uplink: Option<ObjectId>,
    /// Global router address on the internal network
    pub eucart_address: Option<Ipv4Addr>,
    /// Subnet name -> VPC router port on that subnet
    pub subnet_ports: BTreeMap<String, ObjectId>,
}

/// Resolve a parsed route to a next hop, or `None` if the target is
/// missing, detached or in another VPC.
pub fn resolve_hop(
    route: &ParsedRoute,
    vpc: &GniVpc,
    gni: &GlobalNetworkInfo,
    hops: &VpcHops,
) -> Option<RouteHop> {
    match route.target {
        RouteTarget::InternetGateway => {
            if !vpc.has_internet_gateway(&route.target_name) {
                warn!(vpc = %vpc.name, target = %route.target_name, "Internet gateway not attached, skipping route");
                return None;
            }
            Some(RouteHop {
                port: hops.uplink.clone()?,
                gateway: hops.eucart_address,
            })
        }
        RouteTarget::NatGateway => {
            let natg = vpc.nat_gateways.iter().find(|n| n.name == route.target_name);
            let Some(natg) = natg else {
                warn!(vpc = %vpc.name, target = %route.target_name, "NAT gateway not in VPC, skipping route");
                return None;
            };
            Some(RouteHop {
                port: hops.subnet_ports.get(&natg.subnet)?.clone(),
                gateway: Some(natg.private_ip),
            })
        }
        RouteTarget::Eni => {
            let eni = gni
                .find_interface(&route.target_name)
                .filter(|i| i.vpc == vpc.name);
            let Some(eni) = eni else {
                warn!(vpc = %vpc.name, target = %route.target_name, "Interface not in VPC, skipping route");
                return None;
            };
            Some(RouteHop {
                port: hops.subnet_ports.get(&eni.subnet)?.clone(),
                gateway: Some(eni.private_ip),
            })
        }
        RouteTarget::Local
        | RouteTarget::VirtualPrivateGateway
        | RouteTarget::Peering
        | RouteTarget::Invalid => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mido_sync_common::gni::{GniInterface, GniNatGateway, GniRouteEntry};

    fn table(entries: &[(&str, &str)]) -> GniRouteTable {
        GniRouteTable {
            name: "rtb-1".to_string(),
            entries: entries
                .iter()
                .map(|(d, t)| GniRouteEntry {
                    destination: d.to_string(),
                    target: t.to_string(),
                })
                .collect(),
        }
    }

    fn vpc() -> GniVpc {
        GniVpc {
            name: "vpc-1".to_string(),
            cidr: "10.0.0.0/16".to_string(),
            internet_gateways: vec!["igw-1".to_string()],
            subnets: vec![],
            route_tables: vec![],
            nat_gateways: vec![GniNatGateway {
                name: "nat-1".to_string(),
                subnet: "subnet-pub".to_string(),
                mac: "d0:0d:00:00:00:99".to_string(),
                private_ip: Ipv4Addr::new(10, 0, 9, 9),
                public_ip: Ipv4Addr::new(203, 0, 113, 9),
            }],
        }
    }

    fn hops() -> VpcHops {
        VpcHops {
            uplink: Some("port-uplink".into()),
            eucart_address: Some(Ipv4Addr::new(169, 254, 0, 1)),
            subnet_ports: BTreeMap::from([
                ("subnet-pub".to_string(), "port-pub".into()),
                ("subnet-1".to_string(), "port-1".into()),
            ]),
        }
    }

    #[test]
    fn test_parse_skips_unusable_entries() {
        let routes = parse_route_table(
            &table(&[
                ("10.0.0.0/16", "local"),
                ("0.0.0.0/0", "igw-1"),
                ("172.16.0.0/12", "vgw-1"),
                ("192.168.0.0/16", "pcx-1"),
                ("8.8.8.8/32", "bogus"),
                ("not-a-cidr", "nat-1"),
                ("198.51.100.0/24", "eni-7"),
            ]),
            10,
        )
        .unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].target, RouteTarget::InternetGateway);
        assert_eq!(routes[1].target, RouteTarget::Eni);
    }

    #[test]
    fn test_route_capacity() {
        let entries: Vec<(String, String)> = (0..4)
            .map(|i| (format!("10.{i}.0.0/16"), "igw-1".to_string()))
            .collect();
        let refs: Vec<(&str, &str)> = entries.iter().map(|(d, t)| (d.as_str(), t.as_str())).collect();
        assert!(parse_route_table(&table(&refs), 4).is_ok());
        assert!(matches!(
            parse_route_table(&table(&refs), 3),
            Err(SyncError::CapacityExceeded { max: 3, .. })
        ));
    }

    #[test]
    fn test_resolve_internet_gateway() {
        let routes = parse_route_table(&table(&[("0.0.0.0/0", "igw-1")]), 5).unwrap();
        let hop = resolve_hop(&routes[0], &vpc(), &GlobalNetworkInfo::default(), &hops()).unwrap();
        assert_eq!(hop.port, "port-uplink".into());
        assert_eq!(hop.gateway, Some(Ipv4Addr::new(169, 254, 0, 1)));

        let detached = parse_route_table(&table(&[("0.0.0.0/0", "igw-2")]), 5).unwrap();
        assert!(resolve_hop(&detached[0], &vpc(), &GlobalNetworkInfo::default(), &hops()).is_none());
    }

    #[test]
    fn test_resolve_nat_and_eni() {
        let gni = GlobalNetworkInfo {
            interfaces: vec![GniInterface {
                name: "eni-7".to_string(),
                instance_id: "i-7".to_string(),
                vpc: "vpc-1".to_string(),
                subnet: "subnet-1".to_string(),
                mac: "d0:0d:00:00:00:07".to_string(),
                private_ip: Ipv4Addr::new(10, 0, 1, 7),
                public_ip: None,
                node: "node-1".to_string(),
                security_groups: vec![],
                src_dst_check: false,
            }],
            ..Default::default()
        };
        let routes = parse_route_table(
            &table(&[("0.0.0.0/0", "nat-1"), ("192.0.2.0/24", "eni-7"), ("198.51.100.0/24", "eni-8")]),
            5,
        )
        .unwrap();

        let nat = resolve_hop(&routes[0], &vpc(), &gni, &hops()).unwrap();
        assert_eq!(nat.port, "port-pub".into());
        assert_eq!(nat.gateway, Some(Ipv4Addr::new(10, 0, 9, 9)));

        let eni = resolve_hop(&routes[1], &vpc(), &gni, &hops()).unwrap();
        assert_eq!(eni.port, "port-1".into());
        assert_eq!(eni.gateway, Some(Ipv4Addr::new(10, 0, 1, 7)));

        assert!(resolve_hop(&routes[2], &vpc(), &gni, &hops()).is_none());
    }
}
