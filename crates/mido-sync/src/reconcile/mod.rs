//! Reconciliation driver
//!
//! A run is three ordered passes over a freshly populated [`Context`]:
//!
//! 1. populate the context from backend tags
//! 2. core infrastructure and gateways
//! 3. VPCs (with subnets, NAT gateways and routes), then security groups,
//!    then instances
//!
//! Failures are isolated per entity and collected in a [`RunReport`]. Only
//! a failed inventory scan or cancellation aborts the run.

pub mod admin;
pub mod cleanup;
pub mod report;

pub use cleanup::{CleanupConfig, CleanupReport, StaleObject, StaleReason};
pub use report::{EntityOutcome, EntityStatus, RunReport};

use crate::backend::{ClientStats, Inventory, MidoApi, MidoClient, ObjectId};
use crate::config::MidoConfig;
use crate::error::{SyncError, SyncResult};
use crate::routes::{RouteHop, VpcHops, parse_route_table, resolve_hop};
use crate::topology::{
    Context, CoreLinks, Instance, RouterIdPool, SecGroup, Subnet, SubnetLinks, Vpc, VpcLinks,
};
use ipnetwork::Ipv4Network;
use mido_sync_common::gni::{GlobalNetworkInfo, GniInterface, GniVpc};
use mido_sync_common::tags::{CORE_OWNER, entity};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Ingress and egress chain of each security group, by name
type SecGroupChains = BTreeMap<String, (Option<ObjectId>, Option<ObjectId>)>;

/// Owns the backend client and the context between runs
pub struct Reconciler<A> {
    client: MidoClient<A>,
    config: MidoConfig,
    ctx: Option<Context>,
}

impl<A: MidoApi> Reconciler<A> {
    pub fn new(api: A, config: MidoConfig) -> Self {
        let client = MidoClient::new(api, config.retry.clone());
        Self {
            client,
            config,
            ctx: None,
        }
    }

    pub fn client(&self) -> &MidoClient<A> {
        &self.client
    }

    pub fn config(&self) -> &MidoConfig {
        &self.config
    }

    /// Context left by the last populate or run
    pub fn context(&self) -> Option<&Context> {
        self.ctx.as_ref()
    }

    /// Drop the context and with it every router ID reservation
    pub fn reinitialize(&mut self) {
        if self.ctx.take().is_some() {
            info!("Discarded reconciliation context");
        }
    }

    /// Scan the backend and rebuild the context without changing anything
    pub async fn populate(&mut self, gni: &GlobalNetworkInfo) -> SyncResult<&Context> {
        let inventory = Inventory::scan(&self.client).await?;
        let ctx = self
            .ctx
            .insert(Context::populate(&self.config, &inventory, gni));
        Ok(&*ctx)
    }

    /// Run one full reconciliation against `gni`.
    ///
    /// Returns `Err` only when the backend cannot be scanned or the run is
    /// cancelled; per-entity failures end up in the report.
    pub async fn run(
        &mut self,
        gni: &GlobalNetworkInfo,
        cancel: &CancellationToken,
    ) -> SyncResult<RunReport> {
        let run_id = Uuid::now_v7().to_string();
        let start = self.client.stats();
        let mut report = RunReport::new(&run_id);
        info!(run_id = %run_id, "Starting reconciliation run");

        let inventory = Inventory::scan(&self.client).await?;
        let mut ctx = Context::populate(&self.config, &inventory, gni);

        let result = self
            .run_passes(&mut ctx, &inventory, gni, cancel, &mut report)
            .await;
        let referenced = ctx.referenced_ids();
        self.ctx = Some(ctx);
        result?;

        if self.config.cleanup_after_run {
            let config = CleanupConfig { dry_run: false };
            match cleanup::cleanup(&self.client, &referenced, &config).await {
                Ok(cleanup) => report.cleanup = Some(cleanup),
                Err(e) => {
                    error!(error = %e, "Cleanup scan failed");
                    report.record("cleanup", "backend", EntityStatus::Failed(e.to_string()));
                }
            }
        }

        let end = self.client.stats();
        report.created = end.created - start.created;
        report.deleted = end.deleted - start.deleted;

        let failed = report.failures().count();
        if failed == 0 {
            info!(
                run_id = %run_id,
                created = report.created,
                deleted = report.deleted,
                "Reconciliation converged"
            );
        } else {
            warn!(
                run_id = %run_id,
                failed,
                created = report.created,
                deleted = report.deleted,
                "Reconciliation finished with failures"
            );
        }
        Ok(report)
    }

    async fn run_passes(
        &self,
        ctx: &mut Context,
        inventory: &Inventory,
        gni: &GlobalNetworkInfo,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> SyncResult<()> {
        checkpoint(cancel, "populate")?;

        let core = self.sync_core(ctx, inventory, report).await;
        checkpoint(cancel, "core infrastructure")?;

        self.sync_vpcs(ctx, gni, core.as_ref(), report).await;
        checkpoint(cancel, "vpcs")?;

        self.sync_secgroups(ctx, gni, report).await;
        checkpoint(cancel, "security groups")?;

        self.sync_instances(ctx, inventory, gni, core.as_ref(), report)
            .await;
        checkpoint(cancel, "instances")
    }

    fn status_since(&self, mark: ClientStats) -> EntityStatus {
        if self.client.stats() == mark {
            EntityStatus::Converged
        } else {
            EntityStatus::Updated
        }
    }

    async fn sync_core(
        &self,
        ctx: &mut Context,
        inventory: &Inventory,
        report: &mut RunReport,
    ) -> Option<CoreLinks> {
        let mark = self.client.stats();
        let links = match ctx.core.ensure(&self.client, &self.config).await {
            Ok(()) => ctx.core.links(&self.config),
            Err(e) => Err(e),
        };
        let links = match links {
            Ok(links) => {
                report.record(entity::CORE, CORE_OWNER, self.status_since(mark));
                links
            }
            Err(e) => {
                error!(error = %e, "Core infrastructure failed, VPC work skipped");
                report.record(entity::CORE, CORE_OWNER, EntityStatus::Failed(e.to_string()));
                return None;
            }
        };

        for (host, result) in ctx
            .core
            .sync_gateways(&self.client, &self.config, inventory)
            .await
        {
            let status = match result {
                Ok(()) => EntityStatus::Converged,
                Err(e) => {
                    warn!(host = %host, error = %e, "Gateway failed");
                    EntityStatus::Failed(e.to_string())
                }
            };
            report.record("gateway", host, status);
        }
        Some(links)
    }

    async fn sync_vpcs(
        &self,
        ctx: &mut Context,
        gni: &GlobalNetworkInfo,
        core: Option<&CoreLinks>,
        report: &mut RunReport,
    ) {
        let names: Vec<String> = ctx.vpcs.keys().cloned().collect();
        for name in names {
            let Some(vpc) = ctx.vpcs.get_mut(&name) else {
                continue;
            };
            match (gni.find_vpc(&name), core) {
                (None, _) => {
                    match delete_vpc_tree(&self.client, vpc, &mut ctx.router_ids).await {
                        Ok(()) => {
                            info!(vpc = %name, "Deleted VPC");
                            report.record(entity::VPC, name.as_str(), EntityStatus::Deleted);
                            ctx.vpcs.remove(&name);
                        }
                        Err(e) => {
                            error!(vpc = %name, error = %e, "Failed to delete VPC");
                            report.record(entity::VPC, name.as_str(), EntityStatus::Failed(e.to_string()));
                        }
                    }
                }
                (Some(model), None) => {
                    report.record(
                        entity::VPC,
                        name.as_str(),
                        EntityStatus::Skipped("core infrastructure failed".to_string()),
                    );
                    skip_subnets(model, "core infrastructure failed", report);
                }
                (Some(model), Some(core)) => {
                    self.sync_vpc(vpc, &mut ctx.router_ids, model, gni, core, report)
                        .await;
                }
            }
        }
    }

    async fn sync_vpc(
        &self,
        vpc: &mut Vpc,
        router_ids: &mut RouterIdPool,
        model: &GniVpc,
        gni: &GlobalNetworkInfo,
        core: &CoreLinks,
        report: &mut RunReport,
    ) {
        let name = model.name.as_str();
        let mark = self.client.stats();
        let links = match vpc.ensure(&self.client, &self.config, core, router_ids).await {
            Ok(()) => vpc.links(&model.cidr, &self.config),
            Err(e) => Err(e),
        };
        let links = match links {
            Ok(links) => {
                report.record(entity::VPC, name, self.status_since(mark));
                links
            }
            Err(e) => {
                error!(vpc = %name, error = %e, "VPC failed");
                report.record(entity::VPC, name, EntityStatus::Failed(e.to_string()));
                skip_subnets(model, &format!("vpc {name} failed"), report);
                return;
            }
        };

        // Subnets that left the model go first, with everything inside them
        let stale: Vec<String> = vpc
            .subnets
            .keys()
            .filter(|s| model.find_subnet(s).is_none())
            .cloned()
            .collect();
        for subnet_name in stale {
            let Some(subnet) = vpc.subnets.get_mut(&subnet_name) else {
                continue;
            };
            match delete_subnet_tree(&self.client, subnet, router_ids).await {
                Ok(()) => {
                    info!(vpc = %name, subnet = %subnet_name, "Deleted subnet");
                    report.record(entity::SUBNET, subnet_name.as_str(), EntityStatus::Deleted);
                    vpc.subnets.remove(&subnet_name);
                }
                Err(e) => {
                    error!(vpc = %name, subnet = %subnet_name, error = %e, "Failed to delete subnet");
                    report.record(entity::SUBNET, subnet_name.as_str(), EntityStatus::Failed(e.to_string()));
                }
            }
        }

        let mut subnet_links: BTreeMap<String, SubnetLinks> = BTreeMap::new();
        let mut changed: BTreeMap<String, bool> = BTreeMap::new();
        for model_subnet in &model.subnets {
            let subnet = vpc
                .subnets
                .entry(model_subnet.name.clone())
                .or_insert_with(|| Subnet::new(&model_subnet.name, name));
            let mark = self.client.stats();
            match subnet.ensure(&self.client, gni, &links, model_subnet).await {
                Ok(sl) => {
                    changed.insert(model_subnet.name.clone(), self.client.stats() != mark);
                    subnet_links.insert(model_subnet.name.clone(), sl);
                }
                Err(e) => {
                    error!(vpc = %name, subnet = %model_subnet.name, error = %e, "Subnet failed");
                    report.record(
                        entity::SUBNET,
                        model_subnet.name.as_str(),
                        EntityStatus::Failed(e.to_string()),
                    );
                }
            }
        }

        for subnet in vpc.subnets.values_mut() {
            self.sync_nat_gateways(subnet, router_ids, model, core, &links, &subnet_links, report)
                .await;
        }
        for natg in &model.nat_gateways {
            if model.find_subnet(&natg.subnet).is_none() {
                warn!(vpc = %name, natg = %natg.name, subnet = %natg.subnet, "NAT gateway subnet not in model");
                report.record(
                    entity::NAT_GATEWAY,
                    natg.name.as_str(),
                    EntityStatus::Skipped(format!("subnet {} not in model", natg.subnet)),
                );
            }
        }

        let hops = VpcHops {
            uplink: Some(links.uplink.clone()),
            eucart_address: Some(core.eucart_address),
            subnet_ports: subnet_links
                .iter()
                .map(|(n, l)| (n.clone(), l.vpc_rt_br_port.clone()))
                .collect(),
        };
        for (subnet_name, sl) in &subnet_links {
            let Some(subnet) = vpc.subnets.get_mut(subnet_name) else {
                continue;
            };
            let status = match self.sync_subnet_routes(subnet, model, gni, &links, sl, &hops).await {
                Ok(routes_changed) => {
                    if routes_changed || changed.get(subnet_name).copied().unwrap_or(false) {
                        EntityStatus::Updated
                    } else {
                        EntityStatus::Converged
                    }
                }
                Err(e) => {
                    error!(vpc = %name, subnet = %subnet_name, error = %e, "Subnet routes failed");
                    EntityStatus::Failed(e.to_string())
                }
            };
            report.record(entity::SUBNET, subnet_name.as_str(), status);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_nat_gateways(
        &self,
        subnet: &mut Subnet,
        router_ids: &mut RouterIdPool,
        model: &GniVpc,
        core: &CoreLinks,
        vpc_links: &VpcLinks,
        subnet_links: &BTreeMap<String, SubnetLinks>,
        report: &mut RunReport,
    ) {
        let subnet_name = subnet.name().to_string();
        let names: Vec<String> = subnet.nat_gateways.keys().cloned().collect();
        for nat_name in names {
            let Some(natg) = subnet.nat_gateways.get_mut(&nat_name) else {
                continue;
            };
            let desired = model
                .nat_gateways
                .iter()
                .find(|n| n.name == nat_name && n.subnet == subnet_name);

            let Some(desired) = desired else {
                match natg.delete(&self.client, router_ids).await {
                    Ok(()) => {
                        info!(natg = %nat_name, "Deleted NAT gateway");
                        report.record(entity::NAT_GATEWAY, nat_name.as_str(), EntityStatus::Deleted);
                        subnet.nat_gateways.remove(&nat_name);
                    }
                    Err(e) => {
                        error!(natg = %nat_name, error = %e, "Failed to delete NAT gateway");
                        report.record(entity::NAT_GATEWAY, nat_name.as_str(), EntityStatus::Failed(e.to_string()));
                    }
                }
                continue;
            };

            let Some(sl) = subnet_links.get(&subnet_name) else {
                report.record(
                    entity::NAT_GATEWAY,
                    nat_name.as_str(),
                    EntityStatus::Skipped(format!("subnet {subnet_name} failed")),
                );
                continue;
            };
            let mark = self.client.stats();
            let status = match natg
                .ensure(&self.client, &self.config, core, vpc_links, sl, desired, router_ids)
                .await
            {
                Ok(()) => self.status_since(mark),
                Err(e) => {
                    error!(natg = %nat_name, error = %e, "NAT gateway failed");
                    EntityStatus::Failed(e.to_string())
                }
            };
            report.record(entity::NAT_GATEWAY, nat_name.as_str(), status);
        }
    }

    async fn sync_subnet_routes(
        &self,
        subnet: &mut Subnet,
        model: &GniVpc,
        gni: &GlobalNetworkInfo,
        vpc_links: &VpcLinks,
        subnet_links: &SubnetLinks,
        hops: &VpcHops,
    ) -> SyncResult<bool> {
        let table = model
            .find_subnet(subnet.name())
            .and_then(|s| s.route_table.as_deref())
            .and_then(|t| {
                let table = model.find_route_table(t);
                if table.is_none() {
                    warn!(vpc = %model.name, subnet = %subnet.name(), table = %t, "Route table not in model");
                }
                table
            });

        let mut routes: Vec<(Ipv4Network, RouteHop)> = Vec::new();
        if let Some(table) = table {
            for route in parse_route_table(table, self.config.max_routes_per_subnet)? {
                if let Some(hop) = resolve_hop(&route, model, gni, hops) {
                    routes.push((route.destination, hop));
                }
            }
        }
        debug!(subnet = %subnet.name(), routes = routes.len(), "Resolved routes");
        subnet
            .sync_routes(&self.client, vpc_links, subnet_links, &routes)
            .await
    }

    async fn sync_secgroups(
        &self,
        ctx: &mut Context,
        gni: &GlobalNetworkInfo,
        report: &mut RunReport,
    ) {
        let stale: Vec<String> = ctx
            .secgroups
            .keys()
            .filter(|n| gni.find_security_group(n).is_none())
            .cloned()
            .collect();
        for name in stale {
            let Some(sg) = ctx.secgroups.get_mut(&name) else {
                continue;
            };
            match sg.delete(&self.client).await {
                Ok(()) => {
                    info!(secgroup = %name, "Deleted security group");
                    report.record(entity::SECGROUP, name.as_str(), EntityStatus::Deleted);
                    ctx.secgroups.remove(&name);
                }
                Err(e) => {
                    error!(secgroup = %name, error = %e, "Failed to delete security group");
                    report.record(entity::SECGROUP, name.as_str(), EntityStatus::Failed(e.to_string()));
                }
            }
        }

        // Every group's address groups must exist before any rule names them
        let mut marks = BTreeMap::new();
        let mut failed: BTreeMap<String, SyncError> = BTreeMap::new();
        for model in &gni.security_groups {
            let sg = ctx
                .secgroups
                .entry(model.name.clone())
                .or_insert_with(|| SecGroup::new(&model.name));
            marks.insert(model.name.clone(), self.client.stats());
            let result = match sg.ensure(&self.client).await {
                Ok(()) => sg.sync_members(&self.client, gni).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                failed.insert(model.name.clone(), e);
            }
        }

        let peers: BTreeMap<String, ObjectId> = ctx
            .secgroups
            .iter()
            .filter_map(|(n, sg)| Some((n.clone(), sg.all_group()?.clone())))
            .collect();
        for model in &gni.security_groups {
            let name = model.name.as_str();
            if let Some(e) = failed.remove(name) {
                error!(secgroup = %name, error = %e, "Security group failed");
                report.record(entity::SECGROUP, name, EntityStatus::Failed(e.to_string()));
                continue;
            }
            let Some(sg) = ctx.secgroups.get_mut(name) else {
                continue;
            };
            let status = match sg
                .sync_rules(&self.client, model, |peer| peers.get(peer).cloned())
                .await
            {
                Ok(_) => match marks.get(name) {
                    Some(mark) => self.status_since(*mark),
                    None => EntityStatus::Updated,
                },
                Err(e) => {
                    error!(secgroup = %name, error = %e, "Security group rules failed");
                    EntityStatus::Failed(e.to_string())
                }
            };
            report.record(entity::SECGROUP, name, status);
        }
    }

    async fn sync_instances(
        &self,
        ctx: &mut Context,
        inventory: &Inventory,
        gni: &GlobalNetworkInfo,
        core: Option<&CoreLinks>,
        report: &mut RunReport,
    ) {
        // Departed interfaces first
        for vpc in ctx.vpcs.values_mut() {
            for subnet in vpc.subnets.values_mut() {
                let stale: Vec<String> = subnet
                    .instances
                    .iter()
                    .filter(|(_, i)| !i.presence.gnipresent)
                    .map(|(n, _)| n.clone())
                    .collect();
                for name in stale {
                    let Some(instance) = subnet.instances.get_mut(&name) else {
                        continue;
                    };
                    match instance.delete(&self.client).await {
                        Ok(()) => {
                            info!(instance = %name, "Deleted instance interface");
                            report.record(entity::INSTANCE, name.as_str(), EntityStatus::Deleted);
                            subnet.instances.remove(&name);
                        }
                        Err(e) => {
                            error!(instance = %name, error = %e, "Failed to delete instance interface");
                            report.record(entity::INSTANCE, name.as_str(), EntityStatus::Failed(e.to_string()));
                        }
                    }
                }
            }
        }

        let chains: SecGroupChains = ctx
            .secgroups
            .iter()
            .map(|(n, sg)| {
                (
                    n.clone(),
                    (sg.ingress_chain().cloned(), sg.egress_chain().cloned()),
                )
            })
            .collect();

        for vpc in ctx.vpcs.values_mut() {
            let Some(model_vpc) = gni.find_vpc(vpc.name()) else {
                continue;
            };
            let vpc_links = vpc.links(&model_vpc.cidr, &self.config).ok();
            for subnet in vpc.subnets.values_mut() {
                let subnet_links = model_vpc
                    .find_subnet(subnet.name())
                    .and_then(|s| subnet.links(&s.cidr).ok());
                for instance in subnet.instances.values_mut() {
                    let Some(iface) = gni.find_interface(instance.name()) else {
                        continue;
                    };
                    let parents = (core, vpc_links.as_ref(), subnet_links.as_ref());
                    let (Some(core), Some(vpc_links), Some(subnet_links)) = parents else {
                        report.record(
                            entity::INSTANCE,
                            iface.name.as_str(),
                            EntityStatus::Skipped(format!(
                                "subnet {} is not converged",
                                iface.subnet
                            )),
                        );
                        continue;
                    };
                    let mark = self.client.stats();
                    let status = match self
                        .sync_instance(instance, iface, inventory, core, vpc_links, subnet_links, &chains)
                        .await
                    {
                        Ok(()) => self.status_since(mark),
                        Err(e) => {
                            error!(instance = %iface.name, error = %e, "Instance interface failed");
                            EntityStatus::Failed(e.to_string())
                        }
                    };
                    report.record(entity::INSTANCE, iface.name.as_str(), status);
                }
            }
        }

        // Interfaces placed in a subnet the model does not declare
        for iface in &gni.interfaces {
            if ctx.find_subnet(&iface.vpc, &iface.subnet).is_none() {
                warn!(instance = %iface.name, vpc = %iface.vpc, subnet = %iface.subnet, "Interface subnet not in model");
                report.record(
                    entity::INSTANCE,
                    iface.name.as_str(),
                    EntityStatus::Skipped(format!("subnet {} not in model", iface.subnet)),
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_instance(
        &self,
        instance: &mut Instance,
        iface: &GniInterface,
        inventory: &Inventory,
        core: &CoreLinks,
        vpc_links: &VpcLinks,
        subnet_links: &SubnetLinks,
        chains: &SecGroupChains,
    ) -> SyncResult<()> {
        if instance.flags.any() {
            info!(instance = %iface.name, flags = ?instance.flags, "Instance interface changed");
        }

        let mut ingress = Vec::new();
        let mut egress = Vec::new();
        for group in &iface.security_groups {
            match chains.get(group) {
                Some((Some(i), Some(e))) => {
                    ingress.push(i.clone());
                    egress.push(e.clone());
                }
                _ => warn!(instance = %iface.name, secgroup = %group, "Security group not present, skipping"),
            }
        }

        instance.ensure(&self.client, subnet_links, iface).await?;
        instance.connect(&self.client, inventory, iface).await?;
        instance
            .connect_elip(&self.client, core, vpc_links, iface)
            .await?;
        instance
            .sync_chains(&self.client, &self.config, core, iface, &ingress, &egress)
            .await?;
        Ok(())
    }
}

fn checkpoint(cancel: &CancellationToken, after: &str) -> SyncResult<()> {
    if cancel.is_cancelled() {
        warn!(after, "Reconciliation cancelled");
        return Err(SyncError::Cancelled {
            after: after.to_string(),
        });
    }
    Ok(())
}

fn skip_subnets(model: &GniVpc, reason: &str, report: &mut RunReport) {
    for subnet in &model.subnets {
        report.record(
            entity::SUBNET,
            subnet.name.as_str(),
            EntityStatus::Skipped(reason.to_string()),
        );
    }
}

/// Delete a subnet with its instances and NAT gateways
pub(crate) async fn delete_subnet_tree<A: MidoApi>(
    client: &MidoClient<A>,
    subnet: &mut Subnet,
    router_ids: &mut RouterIdPool,
) -> SyncResult<()> {
    for instance in subnet.instances.values_mut() {
        instance.delete(client).await?;
    }
    subnet.instances.clear();
    for natg in subnet.nat_gateways.values_mut() {
        natg.delete(client, router_ids).await?;
    }
    subnet.nat_gateways.clear();
    subnet.delete(client).await
}

/// Delete a VPC with every subnet in it
pub(crate) async fn delete_vpc_tree<A: MidoApi>(
    client: &MidoClient<A>,
    vpc: &mut Vpc,
    router_ids: &mut RouterIdPool,
) -> SyncResult<()> {
    for subnet in vpc.subnets.values_mut() {
        delete_subnet_tree(client, subnet, router_ids).await?;
    }
    vpc.subnets.clear();
    vpc.delete(client, router_ids).await
}
