//! Controller configuration for tests
//!
//! Returned as JSON so tests exercise the same loading path as the binary.

use serde_json::json;

/// Compute host registered in every test backend
pub const TEST_NODE: &str = "node-1";

/// Gateway host registered in every test backend
pub const TEST_GATEWAY: &str = "gw-a";

/// A valid configuration with one gateway and fast retries
pub fn test_config_json() -> String {
    json!({
        "controller_host": "clc-1",
        "public_network": "203.0.113.0/24",
        "public_gateway": "203.0.113.1",
        "gateways": [
            { "host": TEST_GATEWAY, "address": "203.0.113.10", "interface": "eth1" }
        ],
        "max_router_ids": 64,
        "retry": { "max_retries": 2, "min_delay_ms": 1, "max_delay_ms": 2 }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_json() {
        let value: serde_json::Value = serde_json::from_str(&test_config_json()).unwrap();
        assert_eq!(value["gateways"][0]["host"], TEST_GATEWAY);
    }
}
