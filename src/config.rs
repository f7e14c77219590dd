//! Construction parameters for the agent and its delivery client
//!
//! Flag parsing and process bootstrap live in the host binary; these
//! structs are the boundary it hands the parsed values across.

use std::time::Duration;

use crate::AS3_SCHEMA_VERSION;

/// Parameters for the device delivery client
#[derive(Clone, Debug)]
pub struct PostParams {
    /// Device base URL (e.g. "https://192.168.10.2")
    pub device_url: String,
    /// HTTP Basic auth username
    pub username: String,
    /// HTTP Basic auth password
    pub password: String,
    /// Extra trusted CA certificates, PEM bundle
    pub trusted_certs: Option<String>,
    /// Skip TLS verification entirely (lab devices only)
    pub ssl_insecure: bool,
    /// Log raw device response bodies on errors
    pub log_response: bool,
}

impl Default for PostParams {
    fn default() -> Self {
        Self {
            device_url: "https://localhost".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            trusted_certs: None,
            ssl_insecure: false,
            log_response: false,
        }
    }
}

/// Parameters for one agent instance
#[derive(Clone, Debug)]
pub struct AgentParams {
    /// Device delivery parameters
    pub post: PostParams,
    /// Debounce interval applied to every request after the first
    pub post_delay: Duration,
    /// Whether to run schema validation before building
    pub schema_validation: bool,
    /// Directory holding the local AS3 schema files
    pub schema_local_path: String,
    /// Scope POSTs to the affected tenants instead of the whole device
    pub filter_tenants: bool,
    /// Base partition the agent manages on the device
    pub default_partition: String,
    /// Static `namespace/name` locator of the user-defined fragment source
    pub user_source: Option<String>,
    /// Static `namespace/name` locator of the override fragment source
    pub override_source: Option<String>,
    /// User-agent tag injected into every declaration's Controls object
    pub user_agent: String,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            post: PostParams::default(),
            post_delay: Duration::ZERO,
            schema_validation: true,
            schema_local_path: "/app/schemas".to_string(),
            filter_tenants: false,
            default_partition: "kubernetes".to_string(),
            user_source: None,
            override_source: None,
            user_agent: concat!("as3-sync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl AgentParams {
    /// Local path of the AS3 schema file the validator is given
    pub fn schema_file_path(&self) -> String {
        format!(
            "{}/as3-schema-{}-cis.json",
            self.schema_local_path.trim_end_matches('/'),
            AS3_SCHEMA_VERSION
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe_for_tests_not_production() {
        let params = AgentParams::default();
        assert_eq!(params.post_delay, Duration::ZERO);
        assert!(params.schema_validation);
        assert!(!params.post.ssl_insecure);
        assert_eq!(params.default_partition, "kubernetes");
        assert!(params.user_source.is_none());
    }

    #[test]
    fn schema_path_follows_the_local_file_convention() {
        let params = AgentParams {
            schema_local_path: "/app/schemas/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            params.schema_file_path(),
            "/app/schemas/as3-schema-3.18.0-cis.json"
        );
    }
}
