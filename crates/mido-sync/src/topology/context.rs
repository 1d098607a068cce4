//! Reconciliation context: everything one run knows about the backend

use super::core::Core;
use super::instance::Instance;
use super::natgateway::NatGateway;
use super::router_id::RouterIdPool;
use super::secgroup::SecGroup;
use super::subnet::Subnet;
use super::vpc::Vpc;
use crate::backend::ObjectId;
use crate::config::MidoConfig;
use std::collections::{BTreeMap, BTreeSet};

/// Owner of every entity for the duration of a run.
///
/// VPCs own their subnets, subnets own their instances and NAT gateways.
/// Parents are found by name through the context, never stored.
#[derive(Debug, Clone)]
pub struct Context {
    pub router_ids: RouterIdPool,
    pub core: Core,
    pub vpcs: BTreeMap<String, Vpc>,
    pub secgroups: BTreeMap<String, SecGroup>,
}

impl Context {
    pub fn new(config: &MidoConfig) -> Self {
        Self {
            router_ids: RouterIdPool::new(config.max_router_ids),
            core: Core::new(),
            vpcs: BTreeMap::new(),
            secgroups: BTreeMap::new(),
        }
    }

    pub fn find_vpc(&self, name: &str) -> Option<&Vpc> {
        self.vpcs.get(name)
    }

    pub fn find_subnet(&self, vpc: &str, subnet: &str) -> Option<&Subnet> {
        self.vpcs.get(vpc)?.subnets.get(subnet)
    }

    /// Look a subnet up without knowing its VPC
    pub fn find_subnet_global(&self, subnet: &str) -> Option<(&Vpc, &Subnet)> {
        self.vpcs
            .values()
            .find_map(|vpc| vpc.subnets.get(subnet).map(|s| (vpc, s)))
    }

    /// Look an interface up by interface name or by the instance id it
    /// was created for
    pub fn find_instance_global(&self, name: &str) -> Option<(&Vpc, &Subnet, &Instance)> {
        self.vpcs.values().find_map(|vpc| {
            vpc.subnets.values().find_map(|subnet| {
                subnet
                    .instances
                    .values()
                    .find(|i| i.name() == name || i.instance_id() == Some(name))
                    .map(|i| (vpc, subnet, i))
            })
        })
    }

    pub fn find_nat_gateway_global(&self, name: &str) -> Option<(&Vpc, &Subnet, &NatGateway)> {
        self.vpcs.values().find_map(|vpc| {
            vpc.subnets.values().find_map(|subnet| {
                subnet.nat_gateways.get(name).map(|n| (vpc, subnet, n))
            })
        })
    }

    pub fn find_secgroup(&self, name: &str) -> Option<&SecGroup> {
        self.secgroups.get(name)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.vpcs
            .values()
            .flat_map(|v| v.subnets.values())
            .flat_map(|s| s.instances.values())
    }

    /// Every backend object some entity holds in a slot
    pub fn referenced_ids(&self) -> BTreeSet<ObjectId> {
        let mut ids: BTreeSet<ObjectId> = self.core.ids().cloned().collect();
        for vpc in self.vpcs.values() {
            ids.extend(vpc.ids().cloned());
            for subnet in vpc.subnets.values() {
                ids.extend(subnet.ids().cloned());
                for nat in subnet.nat_gateways.values() {
                    ids.extend(nat.ids().cloned());
                }
                for instance in subnet.instances.values() {
                    ids.extend(instance.ids().cloned());
                }
            }
        }
        for sg in self.secgroups.values() {
            ids.extend(sg.ids().cloned());
        }
        ids
    }

    /// Entity counts for logs: (vpcs, subnets, instances, secgroups)
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let subnets = self.vpcs.values().map(|v| v.subnets.len()).sum();
        (
            self.vpcs.len(),
            subnets,
            self.instances().count(),
            self.secgroups.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::testing::config;

    fn context() -> Context {
        let mut ctx = Context::new(&config());
        let mut vpc = Vpc::new("vpc-1");
        let mut subnet = Subnet::new("subnet-1", "vpc-1");
        subnet
            .instances
            .insert("eni-1".to_string(), Instance::new("eni-1", "subnet-1"));
        subnet
            .nat_gateways
            .insert("nat-1".to_string(), NatGateway::new("nat-1", "subnet-1"));
        vpc.subnets.insert("subnet-1".to_string(), subnet);
        ctx.vpcs.insert("vpc-1".to_string(), vpc);
        ctx.secgroups.insert("sg-1".to_string(), SecGroup::new("sg-1"));
        ctx
    }

    #[test]
    fn test_lookups() {
        let ctx = context();
        assert!(ctx.find_vpc("vpc-1").is_some());
        assert!(ctx.find_subnet("vpc-1", "subnet-1").is_some());
        assert!(ctx.find_subnet("vpc-2", "subnet-1").is_none());
        assert_eq!(
            ctx.find_subnet_global("subnet-1").map(|(v, _)| v.name()),
            Some("vpc-1")
        );
        assert_eq!(
            ctx.find_instance_global("eni-1").map(|(_, s, _)| s.name()),
            Some("subnet-1")
        );
        assert!(ctx.find_nat_gateway_global("nat-1").is_some());
        assert!(ctx.find_nat_gateway_global("nat-2").is_none());
        assert!(ctx.find_secgroup("sg-1").is_some());
        assert_eq!(ctx.counts(), (1, 1, 1, 1));
        assert!(ctx.referenced_ids().is_empty());
    }
}
