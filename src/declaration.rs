//! AS3 declaration document helpers
//!
//! A declaration is an opaque JSON document logically keyed
//! tenant -> application -> pool -> members. The helpers here do the
//! structural work the builder composes: tenant listing, template
//! indexing, pool-member rewrites, `Controls` injection, the empty
//! declaration shell, and structural JSON equality.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::{AS3_SCHEMA_VERSION, MANAGED_PARTITION_SUFFIX};

/// JSON key holding the class of an AS3 object
pub const CLASS_KEY: &str = "class";
/// Class of a tenant (partition) object
pub const CLASS_TENANT: &str = "Tenant";
/// Class of an application object
pub const CLASS_APPLICATION: &str = "Application";
/// Class of a pool object
pub const CLASS_POOL: &str = "Pool";
/// JSON key of the declaration body within the AS3 envelope
pub const DECLARATION_KEY: &str = "declaration";
/// JSON key of the controls object within the declaration body
pub const CONTROLS_KEY: &str = "controls";

/// Base AS3 envelope every generated declaration starts from
pub fn base_declaration() -> Value {
    json!({
        "class": "AS3",
        "declaration": {
            "class": "ADC",
            "schemaVersion": AS3_SCHEMA_VERSION,
            "id": "urn:uuid:B97DFADF-9F0D-4F6C-8D66-E9B52E593694",
            "label": "Agent Declaration",
            "remark": "Auto-generated by as3-sync",
            "controls": {
                "class": "Controls",
            },
        },
    })
}

/// Structural JSON equality on raw payloads
///
/// Key reordering must not be observable: both sides are parsed and the
/// resulting values compared. Unparsable payloads fall back to byte
/// equality so resubmitted garbage still dedupes.
pub fn json_equal(a: &str, b: &str) -> bool {
    match (
        serde_json::from_str::<Value>(a),
        serde_json::from_str::<Value>(b),
    ) {
        (Ok(left), Ok(right)) => left == right,
        _ => a == b,
    }
}

/// List the tenants declared by a document
///
/// Tenants are the children of the `declaration` object whose `class` is
/// `Tenant`. Non-object documents yield an empty list.
pub fn tenants(decl: &Value) -> Vec<String> {
    let Some(body) = decl.get(DECLARATION_KEY).and_then(Value::as_object) else {
        return Vec::new();
    };
    body.iter()
        .filter(|(_, v)| v.get(CLASS_KEY).and_then(Value::as_str) == Some(CLASS_TENANT))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Index a template into its (tenant, application, pool) triples
///
/// Returns `None` when the template has no `declaration` object at all;
/// tenants without applications or pools simply contribute nothing.
pub fn template_index(template: &Value) -> Option<BTreeMap<String, BTreeMap<String, Vec<String>>>> {
    let body = template.get(DECLARATION_KEY)?.as_object()?;

    let mut index = BTreeMap::new();
    for (tenant, tenant_obj) in body {
        let Some(tenant_obj) = tenant_obj.as_object() else {
            continue;
        };
        if tenant_obj.get(CLASS_KEY).and_then(Value::as_str) != Some(CLASS_TENANT) {
            continue;
        }
        let mut apps = BTreeMap::new();
        for (app, app_obj) in tenant_obj {
            let Some(app_obj) = app_obj.as_object() else {
                continue;
            };
            if app_obj.get(CLASS_KEY).and_then(Value::as_str) != Some(CLASS_APPLICATION) {
                continue;
            }
            let pools: Vec<String> = app_obj
                .iter()
                .filter(|(_, v)| v.get(CLASS_KEY).and_then(Value::as_str) == Some(CLASS_POOL))
                .map(|(name, _)| name.clone())
                .collect();
            if !pools.is_empty() {
                apps.insert(app.clone(), pools);
            }
        }
        index.insert(tenant.clone(), apps);
    }
    Some(index)
}

/// Overwrite a pool's member list with discovered endpoints
///
/// All members of one pool share one port (the first discovered
/// endpoint's). Missing path components leave the document untouched.
pub fn update_pool_members(
    decl: &mut Value,
    tenant: &str,
    app: &str,
    pool: &str,
    addresses: Vec<String>,
    port: u16,
) {
    let Some(pool_obj) = decl
        .get_mut(DECLARATION_KEY)
        .and_then(|d| d.get_mut(tenant))
        .and_then(|t| t.get_mut(app))
        .and_then(|a| a.get_mut(pool))
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    pool_obj.insert(
        "members".to_string(),
        json!([{
            "servicePort": port,
            "serverAddresses": addresses,
        }]),
    );
}

/// Unconditionally inject the `Controls` object at the declaration root
///
/// Overwrites anything user-supplied; carries the fixed user-agent tag
/// used for device-side telemetry and identification.
pub fn inject_controls(decl: &mut Value, user_agent: &str) {
    if let Some(body) = decl.get_mut(DECLARATION_KEY).and_then(Value::as_object_mut) {
        body.insert(
            CONTROLS_KEY.to_string(),
            json!({
                "class": "Controls",
                "userAgent": user_agent,
            }),
        );
    }
}

/// Prepare an empty declaration: the base envelope, controls, and an
/// optional bare tenant shell (used to delete that partition on device)
pub fn empty_declaration(user_agent: &str, partition: Option<&str>) -> Value {
    let mut decl = base_declaration();
    inject_controls(&mut decl, user_agent);
    if let Some(partition) = partition {
        if let Some(body) = decl.get_mut(DECLARATION_KEY).and_then(Value::as_object_mut) {
            body.insert(partition.to_string(), json!({ "class": CLASS_TENANT }));
        }
    }
    decl
}

/// The two partition names reserved for the agent itself
///
/// The agent-managed partition `<base>_AS3` and its legacy equivalent
/// `<base>` must not appear as tenants in user-supplied templates.
pub fn reserved_partitions(base_partition: &str) -> [String; 2] {
    let legacy = base_partition
        .strip_suffix(MANAGED_PARTITION_SUFFIX)
        .unwrap_or(base_partition);
    [format!("{}{}", legacy, MANAGED_PARTITION_SUFFIX), legacy.to_string()]
}

/// Find a reserved partition declared as a tenant in the template, if any
pub fn find_reserved_tenant(template: &Value, base_partition: &str) -> Option<String> {
    let reserved = reserved_partitions(base_partition);
    let body = template.get(DECLARATION_KEY)?.as_object()?;
    reserved.into_iter().find(|name| body.contains_key(name))
}

/// Shallow-overlay resource-derived tenants onto a declaration body
pub fn overlay_tenants(decl: &mut Value, tenants: &Map<String, Value>) {
    if let Some(body) = decl.get_mut(DECLARATION_KEY).and_then(Value::as_object_mut) {
        for (name, tenant) in tenants {
            body.insert(name.clone(), tenant.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_template() -> Value {
        json!({
            "class": "AS3",
            "declaration": {
                "class": "ADC",
                "schemaVersion": "3.18.0",
                "Finance": {
                    "class": "Tenant",
                    "frontend": {
                        "class": "Application",
                        "template": "generic",
                        "web_pool": {
                            "class": "Pool",
                            "monitors": ["http"],
                            "members": [{
                                "servicePort": 80,
                                "serverAddresses": []
                            }]
                        }
                    }
                },
                "HR": {
                    "class": "Tenant",
                    "portal": {
                        "class": "Application",
                        "portal_pool": { "class": "Pool" }
                    }
                }
            }
        })
    }

    #[test]
    fn json_equality_ignores_key_order() {
        let a = r#"{"x": 1, "y": {"a": true, "b": [1, 2]}}"#;
        let b = r#"{"y": {"b": [1, 2], "a": true}, "x": 1}"#;
        assert!(json_equal(a, b));
        assert!(!json_equal(a, r#"{"x": 2}"#));
    }

    #[test]
    fn unparsable_payloads_fall_back_to_byte_equality() {
        assert!(json_equal("not json", "not json"));
        assert!(!json_equal("not json", "also not json"));
    }

    #[test]
    fn tenants_lists_only_tenant_class_children() {
        let template = sample_template();
        let mut names = tenants(&template);
        names.sort();
        assert_eq!(names, vec!["Finance", "HR"]);
    }

    #[test]
    fn tenants_of_a_non_object_document_is_empty() {
        assert!(tenants(&json!("just a string")).is_empty());
        assert!(tenants(&json!({ "declaration": 42 })).is_empty());
    }

    #[test]
    fn template_index_walks_tenant_app_pool_triples() {
        let index = template_index(&sample_template()).unwrap();
        assert_eq!(index["Finance"]["frontend"], vec!["web_pool"]);
        assert_eq!(index["HR"]["portal"], vec!["portal_pool"]);
    }

    #[test]
    fn template_without_declaration_body_has_no_index() {
        assert!(template_index(&json!({ "class": "AS3" })).is_none());
    }

    #[test]
    fn pool_member_rewrite_sets_shared_port_and_addresses() {
        let mut template = sample_template();
        update_pool_members(
            &mut template,
            "Finance",
            "frontend",
            "web_pool",
            vec!["10.0.0.1".into(), "10.0.0.2".into()],
            80,
        );

        let members = &template["declaration"]["Finance"]["frontend"]["web_pool"]["members"];
        assert_eq!(
            *members,
            json!([{ "servicePort": 80, "serverAddresses": ["10.0.0.1", "10.0.0.2"] }])
        );
    }

    #[test]
    fn pool_member_rewrite_on_missing_pool_is_a_noop() {
        let mut template = sample_template();
        let before = template.clone();
        update_pool_members(&mut template, "Finance", "frontend", "nope", vec![], 80);
        assert_eq!(template, before);
    }

    #[test]
    fn controls_injection_overwrites_user_supplied_controls() {
        let mut template = sample_template();
        template["declaration"]["controls"] = json!({ "class": "Controls", "userAgent": "spoofed" });

        inject_controls(&mut template, "as3-sync configured");

        assert_eq!(
            template["declaration"]["controls"],
            json!({ "class": "Controls", "userAgent": "as3-sync configured" })
        );
    }

    #[test]
    fn empty_declaration_carries_only_the_partition_shell() {
        let decl = empty_declaration("agent", Some("Finance"));
        assert_eq!(decl["declaration"]["Finance"], json!({ "class": "Tenant" }));
        assert_eq!(tenants(&decl), vec!["Finance"]);

        let bare = empty_declaration("agent", None);
        assert!(tenants(&bare).is_empty());
    }

    // ==========================================================================
    // Story: Reserved Partition Protection
    //
    // The managed partition and its legacy equivalent belong to the agent;
    // user templates must not declare them as tenants.
    // ==========================================================================

    #[test]
    fn reserved_partitions_cover_managed_and_legacy_names() {
        assert_eq!(
            reserved_partitions("kubernetes"),
            ["kubernetes_AS3".to_string(), "kubernetes".to_string()]
        );
        // A base already carrying the suffix normalizes to the same pair
        assert_eq!(
            reserved_partitions("kubernetes_AS3"),
            ["kubernetes_AS3".to_string(), "kubernetes".to_string()]
        );
    }

    #[test]
    fn reserved_tenant_is_detected_in_user_templates() {
        let mut template = sample_template();
        assert_eq!(find_reserved_tenant(&template, "kubernetes"), None);

        template["declaration"]["kubernetes_AS3"] = json!({ "class": "Tenant" });
        assert_eq!(
            find_reserved_tenant(&template, "kubernetes"),
            Some("kubernetes_AS3".to_string())
        );
    }

    #[test]
    fn overlay_replaces_matching_tenants_and_adds_new_ones() {
        let mut decl = sample_template();
        let mut extra = Map::new();
        extra.insert("Derived".to_string(), json!({ "class": "Tenant" }));
        extra.insert("Finance".to_string(), json!({ "class": "Tenant", "replaced": true }));

        overlay_tenants(&mut decl, &extra);

        assert_eq!(decl["declaration"]["Derived"], json!({ "class": "Tenant" }));
        assert_eq!(decl["declaration"]["Finance"]["replaced"], json!(true));
    }
}
