//! Natsync core – service snapshots, rule derivation and the merge algorithm.
//!
//! Everything in this crate is pure: no I/O, no async, no clocks. The
//! reconciler and supervisor crates layer side effects on top of these types.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod derive;
mod merge;

pub use derive::{derive_rules, rule_name, rule_prefix, EXTERNAL_ADDRESS_ANNOTATION, WILDCARD_SOURCE};
pub use merge::{merge_into_state, merge_rules, DNAT_ACTION, OWNED_COLLECTION, OWNED_COLLECTION_PRIORITY};

/// Service kind we act on; everything else is ignored by the supervisor.
pub const LOAD_BALANCER_KIND: &str = "LoadBalancer";

/// Identity of a service: unique (namespace, name) pair at any instant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    pub namespace: String,
    pub name: String,
}

impl ServiceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Transport protocol of a service port. Anything unrecognized maps to TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Case-insensitive parse with the fail-safe TCP default.
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some(v) if v.eq_ignore_ascii_case("udp") => Protocol::Udp,
            _ => Protocol::Tcp,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: u16,
    pub protocol: Protocol,
}

/// What kind of change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// Immutable point-in-time view of an observed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub id: ServiceId,
    /// Service kind classifier; only [`LOAD_BALANCER_KIND`] is actionable.
    pub kind: String,
    pub ports: Vec<ServicePort>,
    pub annotations: BTreeMap<String, String>,
    /// Assigned ingress address; absent until the orchestrator allocates one.
    pub ingress_address: Option<String>,
}

impl ServiceSnapshot {
    pub fn is_load_balancer(&self) -> bool {
        self.kind == LOAD_BALANCER_KIND
    }
}

/// One event pulled from the event source. Deletions carry the last-known
/// snapshot so the reconciler still has the service identity to clean up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub kind: EventKind,
    pub snapshot: ServiceSnapshot,
}

/// A DNAT rule this controller derives and owns. Serializes to the remote
/// wire shape; `extra` round-trips fields we did not author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatRule {
    pub name: String,
    pub protocol: Protocol,
    pub source_address: String,
    pub destination_address: String,
    pub destination_port: u16,
    pub translated_address: String,
    pub translated_port: u16,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Action classifier on a rule collection (`{"type": "Dnat"}` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionAction {
    #[serde(rename = "type")]
    pub kind: String,
}

/// One named rule collection on the remote firewall. Rules are kept as raw
/// JSON; collections we do not own pass through untouched, and within our
/// own collection only prefix-matched entries are ever replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCollection {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<CollectionAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallProperties {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nat_rule_collections: Vec<RuleCollection>,
    /// Every other property (network/application collections, addressing,
    /// SKU, ...) is foreign state and must survive the full-replace write.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The whole remote firewall object. The controller reads it, rewrites the
/// owned NAT collection, and writes it back; all other fields round-trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFirewallState {
    #[serde(default)]
    pub properties: FirewallProperties,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
