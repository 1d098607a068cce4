//! CIDR splitting and address arithmetic
//!
//! Subnets reserve their first addresses the conventional cloud way: the
//! network address itself, the gateway at network+1 and the DNS server at
//! network+2.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Largest prefix length that still leaves room for network, gateway and +2
pub const MAX_SUBNET_PREFIX: u8 = 30;

/// CIDR parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    /// Not of the form `a.b.c.d/len`
    #[error("malformed CIDR '{0}'")]
    Malformed(String),

    /// Prefix leaves no room for the reserved addresses
    #[error("CIDR '{cidr}' is too small (prefix /{prefix}, at most /{MAX_SUBNET_PREFIX})")]
    TooSmall { cidr: String, prefix: u8 },
}

/// A CIDR split into the pieces the topology needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrParts {
    /// Normalized network
    pub cidr: Ipv4Network,
    /// Network base address
    pub network: Ipv4Addr,
    /// Prefix length
    pub prefix: u8,
    /// First usable address (network+1)
    pub gateway: Ipv4Addr,
    /// Second usable address (network+2)
    pub plus_two: Ipv4Addr,
}

impl CidrParts {
    /// Reassemble the normalized network
    pub fn to_network(&self) -> Ipv4Network {
        self.cidr
    }

    /// Gateway address with the subnet's prefix, as assigned to a router port
    pub fn gateway_network(&self) -> Ipv4Network {
        Ipv4Network::new(self.gateway, self.prefix).unwrap_or(self.cidr)
    }
}

/// Parse a strict `a.b.c.d/len` IPv4 network.
///
/// Host bits are cleared, so `10.0.0.7/24` parses as `10.0.0.0/24`.
pub fn parse_network(cidr: &str) -> Result<Ipv4Network, CidrError> {
    let trimmed = cidr.trim();
    if !trimmed.contains('/') {
        return Err(CidrError::Malformed(cidr.to_string()));
    }
    let parsed: Ipv4Network = trimmed
        .parse()
        .map_err(|_| CidrError::Malformed(cidr.to_string()))?;
    Ipv4Network::new(parsed.network(), parsed.prefix())
        .map_err(|_| CidrError::Malformed(cidr.to_string()))
}

/// Split a subnet CIDR into network, prefix, gateway and +2 addresses.
pub fn split_cidr(cidr: &str) -> Result<CidrParts, CidrError> {
    let network = parse_network(cidr)?;
    if network.prefix() > MAX_SUBNET_PREFIX {
        return Err(CidrError::TooSmall {
            cidr: cidr.to_string(),
            prefix: network.prefix(),
        });
    }

    let base = u32::from(network.network());
    Ok(CidrParts {
        cidr: network,
        network: network.network(),
        prefix: network.prefix(),
        gateway: Ipv4Addr::from(base + 1),
        plus_two: Ipv4Addr::from(base + 2),
    })
}

/// Check whether `ip` is the +2 (DNS) address of `cidr`.
///
/// Malformed input answers `false`.
pub fn is_plus_two(cidr: &str, ip: Ipv4Addr) -> bool {
    split_cidr(cidr)
        .map(|parts| parts.plus_two == ip)
        .unwrap_or(false)
}

/// The `n`th address of `network`, or `None` if it falls outside.
pub fn nth_address(network: Ipv4Network, n: u32) -> Option<Ipv4Addr> {
    let size = 1u64 << (32 - u32::from(network.prefix()));
    if u64::from(n) >= size {
        return None;
    }
    Some(Ipv4Addr::from(u32::from(network.network()) + n))
}

/// `0.0.0.0/0`
pub fn default_route() -> Ipv4Network {
    Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::UNSPECIFIED))
}

/// A single address as a host route (`/32`)
pub fn host_network(ip: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::from(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_standard_subnet() {
        let parts = split_cidr("10.0.0.0/24").unwrap();
        assert_eq!(parts.network, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(parts.prefix, 24);
        assert_eq!(parts.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parts.plus_two, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_reconstruction_yields_normalized_cidr() {
        for cidr in ["10.0.0.0/24", "172.31.16.0/20", "192.168.7.128/25", "10.0.0.0/8"] {
            let parts = split_cidr(cidr).unwrap();
            assert_eq!(parts.to_network().to_string(), cidr);
        }
        // Host bits are dropped
        let parts = split_cidr("10.1.2.77/16").unwrap();
        assert_eq!(parts.to_network().to_string(), "10.1.0.0/16");
        assert_eq!(parts.gateway, Ipv4Addr::new(10, 1, 0, 1));
    }

    #[test]
    fn test_gateway_network_keeps_prefix() {
        let parts = split_cidr("172.31.0.0/20").unwrap();
        assert_eq!(parts.gateway_network().to_string(), "172.31.0.1/20");
    }

    #[test]
    fn test_malformed() {
        for bad in ["", "10.0.0.0", "10.0.0.0/33", "abc/24", "10.0.0.0/-1"] {
            assert!(
                matches!(split_cidr(bad), Err(CidrError::Malformed(_))),
                "expected malformed for {bad:?}"
            );
        }
    }

    #[test]
    fn test_too_small() {
        assert_eq!(
            split_cidr("10.0.0.0/31"),
            Err(CidrError::TooSmall {
                cidr: "10.0.0.0/31".to_string(),
                prefix: 31
            })
        );
        assert!(split_cidr("10.0.0.0/30").is_ok());
    }

    #[test]
    fn test_is_plus_two() {
        assert!(is_plus_two("10.0.1.0/24", Ipv4Addr::new(10, 0, 1, 2)));
        assert!(!is_plus_two("10.0.1.0/24", Ipv4Addr::new(10, 0, 1, 1)));
        assert!(!is_plus_two("garbage", Ipv4Addr::new(10, 0, 1, 2)));
    }

    #[test]
    fn test_nth_address() {
        let net: Ipv4Network = "169.254.0.0/17".parse().unwrap();
        assert_eq!(nth_address(net, 1), Some(Ipv4Addr::new(169, 254, 0, 1)));
        assert_eq!(nth_address(net, 300), Some(Ipv4Addr::new(169, 254, 1, 44)));
        assert_eq!(nth_address(net, 32768), None);
    }

    #[test]
    fn test_default_route() {
        assert_eq!(default_route().to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_host_network() {
        assert_eq!(
            host_network(Ipv4Addr::new(1, 2, 3, 4)).to_string(),
            "1.2.3.4/32"
        );
    }
}
