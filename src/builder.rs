//! Declaration unification helpers and collaborator seams
//!
//! The deployer composes a unified declaration from three inputs: the
//! user-defined template, the resource-derived tenants, and the override
//! fragment. This module holds the pure pieces of that pipeline (template
//! parsing, tenant diffing, discovery fill with member-churn accounting,
//! deep-merge override application) plus the two collaborator traits
//! whose implementations live with the host: schema validation and
//! override merging.

use std::collections::HashSet;

#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::debug;

use crate::declaration::{template_index, update_pool_members};
use crate::error::Error;
use crate::types::{pool_selector, EndpointDiscovery, Member};
use crate::Result;

/// Schema validation hook applied to the user template before building
///
/// The concrete validator (and the schema file it loads) belongs to the
/// host; a disabled or absent validator accepts everything.
#[cfg_attr(test, automock)]
pub trait SchemaValidator: Send + Sync {
    /// Whether the raw template payload validates against the AS3 schema
    fn validate(&self, template: &str) -> bool;
}

/// Override application seam
///
/// Merges the override declaration on top of the unified document.
/// `None` signals a failed merge; the deployer treats that as non-fatal
/// and delivers the unified document without the override.
#[cfg_attr(test, automock)]
pub trait OverrideMerger: Send + Sync {
    /// Merge `override_decl` onto `unified`, override values winning
    fn merge(&self, override_decl: &Value, unified: &Value) -> Option<Value>;
}

/// Default [`OverrideMerger`]: recursive JSON deep merge
///
/// Objects merge key-by-key with the override side winning; arrays and
/// scalars are replaced wholesale.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeclarationMerger;

impl OverrideMerger for DeclarationMerger {
    fn merge(&self, override_decl: &Value, unified: &Value) -> Option<Value> {
        if !override_decl.is_object() || !unified.is_object() {
            return None;
        }
        let mut merged = unified.clone();
        deep_merge(&mut merged, override_decl);
        Some(merged)
    }
}

/// Recursively merge `overlay` into `base`, overlay values winning
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, value) => *base_slot = value.clone(),
    }
}

/// Parse a raw fragment payload into a declaration document
///
/// The payload must be a JSON object; anything else is a validation
/// error rather than a serialization one, since it parsed fine.
pub fn parse_template(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::serialization(format!("declaration payload: {}", e)))?;
    if !value.is_object() {
        return Err(Error::validation("declaration payload is not a JSON object"));
    }
    Ok(value)
}

/// Tenants present in the previous delivery but absent from the current one
///
/// These partitions must be deleted on the device before the new unified
/// declaration is posted, otherwise they linger forever.
pub fn stale_tenants(previous: &[String], current: &[String]) -> Vec<String> {
    previous
        .iter()
        .filter(|name| !current.contains(*name))
        .cloned()
        .collect()
}

/// Resolve every pool in the document against endpoint discovery
///
/// Pools whose selector resolves to no endpoints keep whatever members
/// the template declared. All members of one pool share the first
/// discovered endpoint's port. Returns the full set of discovered
/// members; churn against `previous` is logged member by member.
pub fn fill_pool_members(
    decl: &mut Value,
    discovery: &dyn EndpointDiscovery,
    previous: &HashSet<Member>,
) -> HashSet<Member> {
    let Some(index) = template_index(decl) else {
        return HashSet::new();
    };

    let mut current = HashSet::new();
    for (tenant, apps) in &index {
        for (app, pools) in apps {
            for pool in pools {
                let members = discovery.lookup(&pool_selector(tenant, app, pool));
                if members.is_empty() {
                    debug!(tenant, app, pool, "no endpoints discovered, pool left as declared");
                    continue;
                }
                let port = members[0].port;
                let addresses = members.iter().map(|m| m.address.clone()).collect();
                update_pool_members(decl, tenant, app, pool, addresses, port);
                current.extend(members);
            }
        }
    }

    for member in current.difference(previous) {
        debug!(member = %member, "pool member added");
    }
    for member in previous.difference(&current) {
        debug!(member = %member, "pool member removed");
    }
    current
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::types::MockEndpointDiscovery;

    use super::*;

    // ==========================================================================
    // Story: Override Deep Merge
    //
    // The override declaration patches the unified document: nested objects
    // merge, everything else is replaced, and untouched branches survive.
    // ==========================================================================

    #[test]
    fn override_values_win_and_untouched_branches_survive() {
        let unified = json!({
            "class": "AS3",
            "declaration": {
                "class": "ADC",
                "Finance": {
                    "class": "Tenant",
                    "frontend": { "class": "Application", "template": "generic" }
                }
            }
        });
        let override_decl = json!({
            "declaration": {
                "Finance": {
                    "frontend": { "template": "https" }
                }
            }
        });

        let merged = DeclarationMerger.merge(&override_decl, &unified).unwrap();
        assert_eq!(
            merged["declaration"]["Finance"]["frontend"]["template"],
            json!("https")
        );
        // Untouched siblings are intact
        assert_eq!(merged["declaration"]["class"], json!("ADC"));
        assert_eq!(merged["declaration"]["Finance"]["class"], json!("Tenant"));
        assert_eq!(merged["class"], json!("AS3"));
    }

    #[test]
    fn arrays_are_replaced_not_merged() {
        let mut base = json!({ "monitors": ["http", "tcp"] });
        deep_merge(&mut base, &json!({ "monitors": ["https"] }));
        assert_eq!(base["monitors"], json!(["https"]));
    }

    #[test]
    fn merge_rejects_non_object_documents() {
        assert!(DeclarationMerger.merge(&json!([1, 2]), &json!({})).is_none());
        assert!(DeclarationMerger.merge(&json!({}), &json!("nope")).is_none());
    }

    // ==========================================================================
    // Story: Template Parsing
    // ==========================================================================

    #[test]
    fn template_must_be_valid_json() {
        assert!(matches!(
            parse_template("{ not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn template_must_be_an_object() {
        assert!(matches!(
            parse_template("[1, 2, 3]"),
            Err(Error::Validation(_))
        ));
        assert!(parse_template(r#"{"class": "AS3"}"#).is_ok());
    }

    // ==========================================================================
    // Story: Tenant Diff
    // ==========================================================================

    #[test]
    fn tenants_removed_from_the_template_are_stale() {
        let previous = vec!["Finance".to_string(), "HR".to_string(), "Eng".to_string()];
        let current = vec!["Finance".to_string()];
        assert_eq!(stale_tenants(&previous, &current), vec!["HR", "Eng"]);
    }

    #[test]
    fn no_stale_tenants_when_nothing_was_removed() {
        let previous = vec!["Finance".to_string()];
        let current = vec!["Finance".to_string(), "HR".to_string()];
        assert!(stale_tenants(&previous, &current).is_empty());
    }

    // ==========================================================================
    // Story: Discovery Fill
    //
    // Every pool is resolved through its label selector; pools with no
    // endpoints keep their declared members.
    // ==========================================================================

    fn two_pool_template() -> Value {
        json!({
            "class": "AS3",
            "declaration": {
                "class": "ADC",
                "Finance": {
                    "class": "Tenant",
                    "frontend": {
                        "class": "Application",
                        "web_pool": { "class": "Pool" },
                        "api_pool": {
                            "class": "Pool",
                            "members": [{ "servicePort": 9090, "serverAddresses": ["192.0.2.1"] }]
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn discovered_endpoints_overwrite_pool_members() {
        let mut discovery = MockEndpointDiscovery::new();
        discovery.expect_lookup().returning(|selector| {
            if selector.ends_with("as3-pool=web_pool") {
                vec![
                    Member { address: "10.0.0.1".into(), port: 80 },
                    Member { address: "10.0.0.2".into(), port: 80 },
                ]
            } else {
                Vec::new()
            }
        });

        let mut decl = two_pool_template();
        let members = fill_pool_members(&mut decl, &discovery, &HashSet::new());

        assert_eq!(
            decl["declaration"]["Finance"]["frontend"]["web_pool"]["members"],
            json!([{ "servicePort": 80, "serverAddresses": ["10.0.0.1", "10.0.0.2"] }])
        );
        // api_pool resolved to nothing: declared members untouched
        assert_eq!(
            decl["declaration"]["Finance"]["frontend"]["api_pool"]["members"],
            json!([{ "servicePort": 9090, "serverAddresses": ["192.0.2.1"] }])
        );
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn lookup_uses_the_tenant_app_pool_selector() {
        let mut discovery = MockEndpointDiscovery::new();
        discovery
            .expect_lookup()
            .withf(|selector| {
                selector == "cis.f5.com/as3-tenant=Finance,cis.f5.com/as3-app=frontend,cis.f5.com/as3-pool=web_pool"
                    || selector.ends_with("as3-pool=api_pool")
            })
            .times(2)
            .returning(|_| Vec::new());

        let mut decl = two_pool_template();
        let members = fill_pool_members(&mut decl, &discovery, &HashSet::new());
        assert!(members.is_empty());
    }

    #[test]
    fn member_set_reflects_only_the_current_snapshot() {
        let mut discovery = MockEndpointDiscovery::new();
        discovery.expect_lookup().returning(|selector| {
            if selector.ends_with("as3-pool=web_pool") {
                vec![Member { address: "10.0.0.3".into(), port: 80 }]
            } else {
                Vec::new()
            }
        });

        let previous: HashSet<Member> =
            [Member { address: "10.0.0.1".into(), port: 80 }].into_iter().collect();

        let mut decl = two_pool_template();
        let current = fill_pool_members(&mut decl, &discovery, &previous);

        assert!(current.contains(&Member { address: "10.0.0.3".into(), port: 80 }));
        assert!(!current.contains(&Member { address: "10.0.0.1".into(), port: 80 }));
    }
}
