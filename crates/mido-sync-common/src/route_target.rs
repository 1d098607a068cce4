//! Route-table target classification

use serde::Serialize;

/// What a route-table entry points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RouteTarget {
    /// The VPC's own CIDR (`local`)
    Local,
    /// Internet gateway (`igw-…`)
    InternetGateway,
    /// Virtual private gateway (`vgw-…`)
    VirtualPrivateGateway,
    /// Elastic network interface (`eni-…`)
    Eni,
    /// VPC peering connection (`pcx-…`)
    Peering,
    /// NAT gateway (`nat-…`)
    NatGateway,
    /// Anything else
    Invalid,
}

const PREFIXES: &[(&str, RouteTarget)] = &[
    ("igw-", RouteTarget::InternetGateway),
    ("vgw-", RouteTarget::VirtualPrivateGateway),
    ("eni-", RouteTarget::Eni),
    ("pcx-", RouteTarget::Peering),
    ("nat-", RouteTarget::NatGateway),
];

/// Classify a route-table entry target by its identifier.
///
/// Total: every input maps to exactly one variant. A bare prefix without an
/// identifier after it is `Invalid`.
pub fn classify_route_target(target: &str) -> RouteTarget {
    if target == "local" {
        return RouteTarget::Local;
    }
    PREFIXES
        .iter()
        .find_map(|(prefix, kind)| {
            target
                .strip_prefix(prefix)
                .filter(|rest| is_identifier(rest))
                .map(|_| *kind)
        })
        .unwrap_or(RouteTarget::Invalid)
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())
}

impl RouteTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteTarget::Local => "local",
            RouteTarget::InternetGateway => "internet-gateway",
            RouteTarget::VirtualPrivateGateway => "virtual-private-gateway",
            RouteTarget::Eni => "eni",
            RouteTarget::Peering => "peering",
            RouteTarget::NatGateway => "nat-gateway",
            RouteTarget::Invalid => "invalid",
        }
    }
}
