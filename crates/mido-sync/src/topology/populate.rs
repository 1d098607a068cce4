//! Rebuild the context from backend tags
//!
//! Entities are discovered from the union of the model and the backend
//! owners, so tagged objects whose entity left the model are still found
//! and can be deleted. Populate order matters: an object only fills a slot
//! once everything it references is known, so shared objects come first.

use super::context::Context;
use super::instance::Instance;
use super::natgateway::NatGateway;
use super::secgroup::SecGroup;
use super::subnet::Subnet;
use super::vpc::Vpc;
use crate::backend::{Inventory, ObjectId};
use crate::config::MidoConfig;
use mido_sync_common::gni::GlobalNetworkInfo;
use mido_sync_common::tags::entity;
use std::collections::BTreeSet;
use tracing::{debug, info};

fn union<'a>(model: impl Iterator<Item = &'a str>, backend: BTreeSet<String>) -> BTreeSet<String> {
    let mut names = backend;
    names.extend(model.map(str::to_string));
    names
}

impl Context {
    /// Build a fresh context from a backend snapshot and the model
    pub fn populate(config: &MidoConfig, inventory: &Inventory, gni: &GlobalNetworkInfo) -> Self {
        let mut ctx = Context::new(config);
        let mut known: BTreeSet<ObjectId> = inventory.host_ids().cloned().collect();

        ctx.core.populate(inventory, &mut known);
        ctx.populate_secgroups(inventory, gni, &mut known);
        ctx.populate_vpcs(inventory, gni, &mut known);
        ctx.compute_instance_flags(inventory, gni);

        let (vpcs, subnets, instances, secgroups) = ctx.counts();
        info!(
            vpcs,
            subnets,
            instances,
            secgroups,
            router_ids = ctx.router_ids.in_use(),
            "Populated topology from backend"
        );
        ctx
    }

    fn populate_secgroups(
        &mut self,
        inventory: &Inventory,
        gni: &GlobalNetworkInfo,
        known: &mut BTreeSet<ObjectId>,
    ) {
        let names = union(
            gni.security_groups.iter().map(|g| g.name.as_str()),
            inventory.owners(entity::SECGROUP),
        );
        for name in names {
            let mut sg = SecGroup::new(&name);
            sg.populate_slots(inventory, known);
            sg.presence.gnipresent = gni.find_security_group(&name).is_some();
            self.secgroups.insert(name, sg);
        }
        // Rules may name any group's address groups as peers
        for sg in self.secgroups.values_mut() {
            sg.populate_members(inventory, known);
        }
    }

    fn populate_vpcs(
        &mut self,
        inventory: &Inventory,
        gni: &GlobalNetworkInfo,
        known: &mut BTreeSet<ObjectId>,
    ) {
        let names = union(
            gni.vpcs.iter().map(|v| v.name.as_str()),
            inventory.owners(entity::VPC),
        );
        for name in names {
            let model = gni.find_vpc(&name);
            let mut vpc = Vpc::new(&name);
            vpc.populate(inventory, known, &mut self.router_ids);
            vpc.presence.gnipresent = model.is_some();

            let subnet_names = union(
                model.into_iter().flat_map(|m| m.subnets.iter().map(|s| s.name.as_str())),
                inventory.owners_under(entity::SUBNET, &name),
            );
            for subnet_name in subnet_names {
                let model_subnet = model.and_then(|m| m.find_subnet(&subnet_name));
                let mut subnet = Subnet::new(&subnet_name, &name);
                subnet.populate_slots(inventory, known);
                subnet.presence.gnipresent = model_subnet.is_some();

                let nat_names = union(
                    model
                        .into_iter()
                        .filter(|_| model_subnet.is_some())
                        .flat_map(|m| m.nat_gateways_in(&subnet_name).map(|n| n.name.as_str())),
                    inventory.owners_under(entity::NAT_GATEWAY, &subnet_name),
                );
                for nat_name in nat_names {
                    let mut nat = NatGateway::new(&nat_name, &subnet_name);
                    nat.populate(inventory, known, &mut self.router_ids);
                    nat.presence.gnipresent = model_subnet.is_some()
                        && model.is_some_and(|m| {
                            m.nat_gateways
                                .iter()
                                .any(|n| n.name == nat_name && n.subnet == subnet_name)
                        });
                    subnet.nat_gateways.insert(nat_name, nat);
                }

                let instance_names = union(
                    gni.interfaces_in(&name, &subnet_name)
                        .filter(|_| model_subnet.is_some())
                        .map(|i| i.name.as_str()),
                    inventory.owners_under(entity::INSTANCE, &subnet_name),
                );
                for instance_name in instance_names {
                    let mut instance = Instance::new(&instance_name, &subnet_name);
                    instance.populate(inventory, known);
                    instance.presence.gnipresent = model_subnet.is_some()
                        && gni
                            .find_interface(&instance_name)
                            .is_some_and(|i| i.vpc == name && i.subnet == subnet_name);
                    subnet.instances.insert(instance_name, instance);
                }

                debug!(
                    vpc = %name,
                    subnet = %subnet_name,
                    state = ?subnet.presence.state(),
                    instances = subnet.instances.len(),
                    nat_gateways = subnet.nat_gateways.len(),
                    "Populated subnet"
                );
                vpc.subnets.insert(subnet_name, subnet);
            }
            // Routes may point at any sibling subnet's router port
            for subnet in vpc.subnets.values_mut() {
                subnet.populate_routes(inventory, known);
            }
            self.vpcs.insert(name, vpc);
        }
    }

    fn compute_instance_flags(&mut self, inventory: &Inventory, gni: &GlobalNetworkInfo) {
        let secgroups = &self.secgroups;
        for vpc in self.vpcs.values_mut() {
            for subnet in vpc.subnets.values_mut() {
                for instance in subnet.instances.values_mut() {
                    let Some(iface) = gni.find_interface(instance.name()) else {
                        continue;
                    };
                    let sg_ingress: Vec<ObjectId> = iface
                        .security_groups
                        .iter()
                        .filter_map(|g| secgroups.get(g)?.ingress_chain().cloned())
                        .collect();
                    instance.compute_flags(iface, inventory.host_id(&iface.node), &sg_ingress);
                }
            }
        }
    }
}
