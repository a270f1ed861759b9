//! Merge of desired rules into the owned remote rule collection.

use serde_json::Value;

use crate::{CollectionAction, NatRule, RemoteFirewallState, RuleCollection};

/// Name of the single rule collection this controller owns.
pub const OWNED_COLLECTION: &str = "natsync-dnat";

/// Priority assigned when the owned collection is first created.
pub const OWNED_COLLECTION_PRIORITY: u32 = 210;

/// Action classifier of the owned collection.
pub const DNAT_ACTION: &str = "Dnat";

/// Combine the existing rules of a collection with one service's desired
/// rules. Rules whose name carries `prefix` are dropped (stale state from an
/// earlier reconciliation of the same service), desired rules are appended,
/// everything else is carried through in its original relative order.
///
/// Total by construction: entries without a parseable name fail the prefix
/// match and are preserved.
pub fn merge_rules(existing: &[Value], prefix: &str, desired: &[NatRule]) -> Vec<Value> {
    let mut out: Vec<Value> = existing
        .iter()
        .filter(|rule| {
            !rule
                .get("name")
                .and_then(Value::as_str)
                .map(|name| name.starts_with(prefix))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    out.extend(desired.iter().map(|rule| {
        serde_json::to_value(rule).expect("NatRule serializes to plain JSON")
    }));
    out
}

/// Rewrite the owned collection of `state` in place, leaving every other
/// collection and field untouched. Returns whether the owned collection's
/// content changed in substance, so callers can elide the remote write.
///
/// A missing owned collection is created (fixed priority, DNAT action) only
/// when there are rules to insert; an empty desired set against a missing
/// collection is a no-op.
pub fn merge_into_state(state: &mut RemoteFirewallState, prefix: &str, desired: &[NatRule]) -> bool {
    let collections = &mut state.properties.nat_rule_collections;
    match collections.iter_mut().find(|c| c.name == OWNED_COLLECTION) {
        Some(owned) => {
            let next = merge_rules(&owned.rules, prefix, desired);
            if next == owned.rules {
                return false;
            }
            owned.rules = next;
            true
        }
        None => {
            if desired.is_empty() {
                return false;
            }
            collections.push(RuleCollection {
                name: OWNED_COLLECTION.to_string(),
                priority: Some(OWNED_COLLECTION_PRIORITY),
                action: Some(CollectionAction { kind: DNAT_ACTION.to_string() }),
                rules: merge_rules(&[], prefix, desired),
                extra: serde_json::Map::new(),
            });
            true
        }
    }
}
