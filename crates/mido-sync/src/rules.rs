//! Filter-rule translation
//!
//! Security-group rules from the model become accept rules in the group's
//! ingress or egress chain, one per peer. Instance chains are generated
//! from instance attributes.

use crate::backend::{ObjectId, PortRange, RuleAction, RuleMatch, RuleSpec};
use crate::error::{SyncError, SyncResult};
use ipnetwork::Ipv4Network;
use mido_sync_common::cidr::{host_network, parse_network};
use mido_sync_common::gni::GniRule;
use std::net::Ipv4Addr;

pub const PROTO_ALL: i32 = -1;
pub const PROTO_ICMP: i32 = 1;
pub const PROTO_TCP: i32 = 6;
pub const PROTO_UDP: i32 = 17;

/// Which side of a security group a rule belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Traffic towards members; peers match the source
    Ingress,
    /// Traffic from members; peers match the destination
    Egress,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

/// `-1` (or absent) means "any"
fn optional_u8(value: Option<i32>, field: &str) -> SyncResult<Option<u8>> {
    match value {
        None | Some(-1) => Ok(None),
        Some(v) => u8::try_from(v)
            .map(Some)
            .map_err(|_| SyncError::UnsupportedRule(format!("{field} {v} out of range"))),
    }
}

fn port_range(rule: &GniRule) -> SyncResult<Option<PortRange>> {
    match (rule.from_port, rule.to_port) {
        (None | Some(-1), None | Some(-1)) => Ok(None),
        (Some(from), Some(to)) => {
            let start = u16::try_from(from)
                .map_err(|_| SyncError::MalformedInput(format!("port {from} out of range")))?;
            let end = u16::try_from(to)
                .map_err(|_| SyncError::MalformedInput(format!("port {to} out of range")))?;
            if start > end {
                return Err(SyncError::MalformedInput(format!(
                    "port range {start}-{end} is inverted"
                )));
            }
            Ok(Some(PortRange { start, end }))
        }
        (from, to) => Err(SyncError::MalformedInput(format!(
            "incomplete port range {from:?}-{to:?}"
        ))),
    }
}

/// Protocol part of the match, shared by every peer of the rule
fn protocol_match(rule: &GniRule) -> SyncResult<RuleMatch> {
    let mut m = RuleMatch::default();
    match rule.protocol {
        PROTO_ALL => {}
        PROTO_ICMP => {
            m.nw_proto = Some(1);
            m.icmp_type = optional_u8(rule.icmp_type, "icmp type")?;
            m.icmp_code = optional_u8(rule.icmp_code, "icmp code")?;
        }
        PROTO_TCP | PROTO_UDP => {
            m.nw_proto = Some(rule.protocol as u8);
            m.tp_dst = port_range(rule)?;
        }
        p @ 0..=255 => {
            let has_ports = [rule.from_port, rule.to_port, rule.icmp_type, rule.icmp_code]
                .iter()
                .any(|v| matches!(v, Some(x) if *x != -1));
            if has_ports {
                return Err(SyncError::UnsupportedRule(format!(
                    "protocol {p} does not take ports or icmp fields"
                )));
            }
            m.nw_proto = Some(p as u8);
        }
        p => {
            return Err(SyncError::MalformedInput(format!("protocol {p} out of range")));
        }
    }
    Ok(m)
}

/// Translate one model rule into one match per peer.
///
/// `resolve_group` maps a peer security-group name to its "all members"
/// address group. A malformed or unsupported rule fails as a whole so the
/// caller can skip it.
pub fn translate_rule(
    rule: &GniRule,
    direction: Direction,
    resolve_group: impl Fn(&str) -> Option<ObjectId>,
) -> SyncResult<Vec<RuleMatch>> {
    let base = protocol_match(rule)?;
    let mut matches = Vec::with_capacity(rule.cidrs.len() + rule.groups.len());

    for cidr in &rule.cidrs {
        let network = parse_network(cidr)?;
        let mut m = base.clone();
        match direction {
            Direction::Ingress => m.nw_src = Some(network),
            Direction::Egress => m.nw_dst = Some(network),
        }
        matches.push(m);
    }

    for group in &rule.groups {
        let iag = resolve_group(group).ok_or_else(|| {
            SyncError::MalformedInput(format!("rule references unknown security group '{group}'"))
        })?;
        let mut m = base.clone();
        match direction {
            Direction::Ingress => m.ip_addr_group_src = Some(iag),
            Direction::Egress => m.ip_addr_group_dst = Some(iag),
        }
        matches.push(m);
    }

    Ok(matches)
}

/// Number rules from position 0
pub fn positioned(chain: &ObjectId, rules: Vec<(RuleAction, RuleMatch)>) -> Vec<RuleSpec> {
    rules
        .into_iter()
        .enumerate()
        .map(|(pos, (action, m))| RuleSpec::new(chain.clone(), pos as u32, action).with_match(m))
        .collect()
}

fn return_flow() -> (RuleAction, RuleMatch) {
    (
        RuleAction::Accept,
        RuleMatch {
            match_return_flow: true,
            ..Default::default()
        },
    )
}

fn jumps(chains: &[ObjectId]) -> impl Iterator<Item = (RuleAction, RuleMatch)> + '_ {
    chains.iter().map(|target| {
        (
            RuleAction::Jump {
                target: target.clone(),
            },
            RuleMatch::default(),
        )
    })
}

/// Rules for traffic towards an instance: return flows, then each
/// group's ingress chain, then drop.
pub fn instance_pre_rules(chain: &ObjectId, sg_ingress_chains: &[ObjectId]) -> Vec<RuleSpec> {
    let mut rules = vec![return_flow()];
    rules.extend(jumps(sg_ingress_chains));
    rules.push((RuleAction::Drop, RuleMatch::default()));
    positioned(chain, rules)
}

/// Attributes that shape an instance's egress chain
#[derive(Debug, Clone)]
pub struct InstanceEgress<'a> {
    pub mac: &'a str,
    pub private_ip: Ipv4Addr,
    pub src_dst_check: bool,
    pub l2_isolation: bool,
    pub metadata_group: &'a ObjectId,
    pub sg_egress_chains: &'a [ObjectId],
}

/// Rules for traffic from an instance: return flows, anti-spoofing,
/// metadata access, each group's egress chain, then drop.
pub fn instance_post_rules(chain: &ObjectId, egress: &InstanceEgress<'_>) -> Vec<RuleSpec> {
    let mut rules = vec![return_flow()];
    if egress.l2_isolation {
        rules.push((
            RuleAction::Drop,
            RuleMatch {
                dl_src: Some(egress.mac.to_ascii_lowercase()),
                inv_dl_src: true,
                ..Default::default()
            },
        ));
    }
    if egress.src_dst_check {
        rules.push((
            RuleAction::Drop,
            RuleMatch {
                nw_src: Some(host_network(egress.private_ip)),
                inv_nw_src: true,
                ..Default::default()
            },
        ));
    }
    rules.push((
        RuleAction::Accept,
        RuleMatch {
            ip_addr_group_dst: Some(egress.metadata_group.clone()),
            ..Default::default()
        },
    ));
    rules.extend(jumps(egress.sg_egress_chains));
    rules.push((RuleAction::Drop, RuleMatch::default()));
    positioned(chain, rules)
}

/// NAT gateway source translation: traffic leaving the VPC CIDR for
/// anywhere outside it is rewritten to the public address.
pub fn nat_snat_rule(chain: &ObjectId, vpc_cidr: Ipv4Network, public_ip: Ipv4Addr) -> RuleSpec {
    RuleSpec::new(chain.clone(), 0, RuleAction::Snat { to: public_ip }).with_match(RuleMatch {
        nw_src: Some(vpc_cidr),
        nw_dst: Some(vpc_cidr),
        inv_nw_dst: true,
        ..Default::default()
    })
}
