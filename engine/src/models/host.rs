//! Host models and the provisioning collaborator

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifier of a deployment target
pub type HostId = String;

/// A deployment target as supplied by host provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// Unique host ID
    pub id: HostId,

    /// How hooks reach the host
    #[serde(default)]
    pub transport: HostTransport,
}

impl HostSpec {
    /// A host that runs hooks on this machine
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: HostTransport::Local,
        }
    }

    /// A host reached over SSH
    pub fn ssh(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            transport: HostTransport::Ssh {
                address: address.into(),
                port,
                user: None,
                identity_file: None,
            },
        }
    }
}

/// Hook transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HostTransport {
    /// Run through the local shell
    #[default]
    Local,

    /// Run through `ssh` in batch mode
    Ssh {
        address: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        identity_file: Option<String>,
    },
}

fn default_ssh_port() -> u16 {
    22
}

/// Host provisioning collaborator
pub trait HostProvider: Send + Sync {
    /// Look up one host
    fn host(&self, id: &str) -> Option<HostSpec>;

    /// All known hosts
    fn hosts(&self) -> Vec<HostSpec>;
}

/// Fixed host inventory, usually loaded from settings
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    hosts: BTreeMap<HostId, HostSpec>,
}

impl StaticInventory {
    pub fn new(hosts: impl IntoIterator<Item = HostSpec>) -> Self {
        Self {
            hosts: hosts.into_iter().map(|h| (h.id.clone(), h)).collect(),
        }
    }
}

impl HostProvider for StaticInventory {
    fn host(&self, id: &str) -> Option<HostSpec> {
        self.hosts.get(id).cloned()
    }

    fn hosts(&self) -> Vec<HostSpec> {
        self.hosts.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults() {
        let host: HostSpec = serde_json::from_str(r#"{"id": "web-1"}"#).unwrap();
        assert_eq!(host.transport, HostTransport::Local);

        let host: HostSpec = serde_json::from_str(
            r#"{"id": "web-2", "transport": {"kind": "ssh", "address": "10.0.0.2"}}"#,
        )
        .unwrap();
        assert_eq!(host, HostSpec::ssh("web-2", "10.0.0.2", 22));
    }

    #[test]
    fn test_static_inventory_lookup() {
        let inventory = StaticInventory::new(vec![HostSpec::local("a"), HostSpec::local("b")]);
        assert!(inventory.host("a").is_some());
        assert!(inventory.host("z").is_none());
        assert_eq!(inventory.hosts().len(), 2);
    }
}
