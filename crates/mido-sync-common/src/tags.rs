//! Backend object tag constants for mido-sync
//!
//! Every object mido-sync creates on the network-virtualization backend is
//! tagged so the topology can be rebuilt from the backend alone after a
//! restart. The tags double as the logical identity used for duplicate
//! detection.
//!
//! ## Tag Schema
//!
//! | Tag Key | Description |
//! |---------|-------------|
//! | `mido-sync:tool` | Static identifier ("mido-sync") |
//! | `mido-sync:entity` | Owning entity kind (see [`entity`]) |
//! | `mido-sync:owner` | Owning entity name (`vpc-…`, `subnet-…`, `eni-…`) |
//! | `mido-sync:parent` | Parent entity name (subnet → VPC, instance → subnet) |
//! | `mido-sync:slot` | Named position in the owner's object table |
//! | `mido-sync:key` | Member key for collection slots (address, position) |
//! | `mido-sync:router-id` | Router ID on router objects |
//! | `mido-sync:created-at` | RFC 3339 creation timestamp |

use std::collections::BTreeMap;

/// Tag key for tool identification - all mido-sync objects have this
pub const TAG_TOOL: &str = "mido-sync:tool";

/// Tag value for tool identification
pub const TAG_TOOL_VALUE: &str = "mido-sync";

/// Tag key for the owning entity kind
pub const TAG_ENTITY: &str = "mido-sync:entity";

/// Tag key for the owning entity name
pub const TAG_OWNER: &str = "mido-sync:owner";

/// Tag key for the parent entity name
pub const TAG_PARENT: &str = "mido-sync:parent";

/// Tag key for the slot name within the owner
pub const TAG_SLOT: &str = "mido-sync:slot";

/// Tag key for collection member keys
pub const TAG_KEY: &str = "mido-sync:key";

/// Tag key for router IDs
pub const TAG_ROUTER_ID: &str = "mido-sync:router-id";

/// Tag key for creation timestamp (RFC 3339 format)
pub const TAG_CREATED_AT: &str = "mido-sync:created-at";

/// Tag map attached to backend objects
pub type Tags = BTreeMap<String, String>;

/// Entity kind values for [`TAG_ENTITY`]
pub mod entity {
    /// Shared infrastructure used by every VPC
    pub const CORE: &str = "core";

    /// Tenant virtual network
    pub const VPC: &str = "vpc";

    /// Subnet within a VPC
    pub const SUBNET: &str = "subnet";

    /// Instance network interface
    pub const INSTANCE: &str = "instance";

    /// NAT gateway within a subnet
    pub const NAT_GATEWAY: &str = "natgateway";

    /// Security group
    pub const SECGROUP: &str = "secgroup";

    /// All entity kinds, in populate order
    pub const ALL: &[&str] = &[CORE, SECGROUP, VPC, SUBNET, NAT_GATEWAY, INSTANCE];
}

/// Owner name used by the core infrastructure
pub const CORE_OWNER: &str = "core";

/// Helper to format creation timestamp for tags
pub fn format_created_at(time: chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339()
}

/// Helper to parse creation timestamp from tags
pub fn parse_created_at(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

/// Check whether a tag map marks an object as created by mido-sync
pub fn is_managed(tags: &Tags) -> bool {
    tags.get(TAG_TOOL).map(String::as_str) == Some(TAG_TOOL_VALUE)
}

/// Identity of a managed object: (entity, owner, parent, slot, key).
///
/// Two live objects with the same identity are duplicates. Returns `None`
/// for objects not created by mido-sync.
pub fn identity(tags: &Tags) -> Option<ObjectIdentity> {
    if !is_managed(tags) {
        return None;
    }
    Some(ObjectIdentity {
        entity: tags.get(TAG_ENTITY)?.clone(),
        owner: tags.get(TAG_OWNER)?.clone(),
        parent: tags.get(TAG_PARENT).cloned(),
        slot: tags.get(TAG_SLOT)?.clone(),
        key: tags.get(TAG_KEY).cloned(),
    })
}

/// Logical identity of a managed object, see [`identity`]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectIdentity {
    pub entity: String,
    pub owner: String,
    pub parent: Option<String>,
    pub slot: String,
    pub key: Option<String>,
}

impl std::fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity, self.owner)?;
        if let Some(parent) = &self.parent {
            write!(f, "@{parent}")?;
        }
        write!(f, ":{}", self.slot)?;
        if let Some(key) = &self.key {
            write!(f, "[{key}]")?;
        }
        Ok(())
    }
}
