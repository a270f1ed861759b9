//! Desired-rule derivation: snapshot in, DNAT rules out.

use serde_json::Map;

use crate::{NatRule, ServiceId, ServiceSnapshot};

/// Annotation whose value is the firewall-facing address a service wants to
/// be reachable on. Absent annotation means "do not expose".
pub const EXTERNAL_ADDRESS_ANNOTATION: &str = "natsync.io/external-address";

/// Match-any source for derived rules.
pub const WILDCARD_SOURCE: &str = "*";

// '/' is not legal in DNS-1123 namespace or service names, so joined names
// cannot collide across distinct (namespace, name, port) triples and the
// per-service prefix is unambiguous.
const SEPARATOR: char = '/';

/// Deterministic name for the rule exposing one port of one service.
pub fn rule_name(id: &ServiceId, port: u16) -> String {
    format!("{}{SEPARATOR}{}{SEPARATOR}{}", id.namespace, id.name, port)
}

/// Prefix owning every rule derived for `id`; drives merge-time removal.
pub fn rule_prefix(id: &ServiceId) -> String {
    format!("{}{SEPARATOR}{}{SEPARATOR}", id.namespace, id.name)
}

/// Derive the rules a snapshot wants on the firewall. Empty output means
/// "this service owns nothing": not a LoadBalancer, no ingress address yet,
/// or no exposure annotation. Pure and idempotent, so retries are safe.
pub fn derive_rules(snapshot: &ServiceSnapshot) -> Vec<NatRule> {
    if !snapshot.is_load_balancer() {
        return Vec::new();
    }
    let ingress = match snapshot.ingress_address.as_deref() {
        Some(a) if !a.trim().is_empty() => a,
        _ => return Vec::new(),
    };
    let external = match snapshot.annotations.get(EXTERNAL_ADDRESS_ANNOTATION) {
        Some(v) if !v.trim().is_empty() => v.trim(),
        _ => return Vec::new(),
    };
    snapshot
        .ports
        .iter()
        .map(|p| NatRule {
            name: rule_name(&snapshot.id, p.port),
            protocol: p.protocol,
            source_address: WILDCARD_SOURCE.to_string(),
            destination_address: external.to_string(),
            destination_port: p.port,
            translated_address: ingress.to_string(),
            translated_port: p.port,
            extra: Map::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Protocol, ServicePort};
    use std::collections::BTreeMap;

    fn snapshot(kind: &str, ingress: Option<&str>, annotation: Option<&str>, ports: Vec<ServicePort>) -> ServiceSnapshot {
        let mut annotations = BTreeMap::new();
        if let Some(v) = annotation {
            annotations.insert(EXTERNAL_ADDRESS_ANNOTATION.to_string(), v.to_string());
        }
        ServiceSnapshot {
            id: ServiceId::new("default", "web"),
            kind: kind.to_string(),
            ports,
            annotations,
            ingress_address: ingress.map(|s| s.to_string()),
        }
    }

    fn tcp(port: u16) -> ServicePort {
        ServicePort { port, protocol: Protocol::Tcp }
    }

    #[test]
    fn non_load_balancer_yields_nothing() {
        let s = snapshot("ClusterIP", Some("10.0.0.5"), Some("20.1.2.3"), vec![tcp(80)]);
        assert!(derive_rules(&s).is_empty());
    }

    #[test]
    fn missing_ingress_yields_nothing() {
        let s = snapshot("LoadBalancer", None, Some("20.1.2.3"), vec![tcp(80)]);
        assert!(derive_rules(&s).is_empty());
    }

    #[test]
    fn missing_or_blank_annotation_yields_nothing() {
        let s = snapshot("LoadBalancer", Some("10.0.0.5"), None, vec![tcp(80)]);
        assert!(derive_rules(&s).is_empty());
        let s = snapshot("LoadBalancer", Some("10.0.0.5"), Some("  "), vec![tcp(80)]);
        assert!(derive_rules(&s).is_empty());
    }

    #[test]
    fn one_rule_per_port_matching_external_and_translating_to_ingress() {
        let ports = vec![tcp(80), ServicePort { port: 443, protocol: Protocol::Udp }];
        let s = snapshot("LoadBalancer", Some("10.0.0.5"), Some("20.1.2.3"), ports);
        let rules = derive_rules(&s);
        assert_eq!(rules.len(), 2);

        assert_eq!(rules[0].name, "default/web/80");
        assert_eq!(rules[0].protocol, Protocol::Tcp);
        assert_eq!(rules[0].source_address, WILDCARD_SOURCE);
        assert_eq!(rules[0].destination_address, "20.1.2.3");
        assert_eq!(rules[0].destination_port, 80);
        assert_eq!(rules[0].translated_address, "10.0.0.5");
        assert_eq!(rules[0].translated_port, 80);

        assert_eq!(rules[1].name, "default/web/443");
        assert_eq!(rules[1].protocol, Protocol::Udp);
    }

    #[test]
    fn derivation_is_idempotent() {
        let s = snapshot("LoadBalancer", Some("10.0.0.5"), Some("20.1.2.3"), vec![tcp(80), tcp(8080)]);
        assert_eq!(derive_rules(&s), derive_rules(&s));
    }

    #[test]
    fn names_cannot_collide_across_identity_triples() {
        // "a/b-c" vs "a-b/c": hyphen-joined names would collide, '/' cannot.
        let n1 = rule_name(&ServiceId::new("a", "b-c"), 80);
        let n2 = rule_name(&ServiceId::new("a-b", "c"), 80);
        assert_ne!(n1, n2);
        assert!(n1.starts_with(&rule_prefix(&ServiceId::new("a", "b-c"))));
        assert!(!n1.starts_with(&rule_prefix(&ServiceId::new("a-b", "c"))));
    }
}
