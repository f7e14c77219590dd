//! HTTP delivery to the device and response classification
//!
//! The `PostManager` performs exactly one POST of the unified declaration
//! per attempt against the device's declarative endpoint and classifies
//! the result into a fixed taxonomy. Retry policy lives in the deployer;
//! this module only reports accept/reject plus the backoff hint.
//!
//! Classification table:
//!
//! | Response                                   | Accepted | Retry delay |
//! |--------------------------------------------|----------|-------------|
//! | 2xx (OK/Created/Accepted)                  | yes      | none        |
//! | 404 Not Found                              | yes*     | none        |
//! | 503 Service Unavailable                    | no       | 3s          |
//! | transport error / malformed body / other   | no       | 30s         |
//!
//! (*) 404 is non-retryable: logged and treated as informational, it needs
//! corrected input rather than another attempt with the same payload.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::{debug, error};

use crate::config::PostParams;
use crate::error::Error;
use crate::{Result, AS3_DECLARE_PATH, AS3_INFO_PATH, AS3_MIN_SUPPORTED_VERSION};

/// Per-request transport timeout; bounds a single attempt and is
/// independent of (and shorter than) the inter-attempt retry delays
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Backoff before retrying a device-busy rejection
pub const RETRY_DELAY_BUSY: Duration = Duration::from_secs(3);

/// Backoff before retrying a transport/other rejection
pub const RETRY_DELAY_OTHER: Duration = Duration::from_secs(30);

/// Classification of one delivery attempt's response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Device applied the declaration (2xx)
    Ok,
    /// Endpoint or referenced entity not found (404); informational
    NotFound,
    /// Device busy (503)
    ServiceUnavailable,
    /// Transport error, malformed body, or any other status
    Common,
}

/// Retry delay dictated by a rejection's classification
pub fn retry_delay(status: ResponseStatus) -> Duration {
    match status {
        ResponseStatus::Ok | ResponseStatus::NotFound => Duration::ZERO,
        ResponseStatus::ServiceUnavailable => RETRY_DELAY_BUSY,
        ResponseStatus::Common => RETRY_DELAY_OTHER,
    }
}

/// Accept/reject verdict plus the classification of one attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PostOutcome {
    /// Whether the attempt is considered delivered (no retry needed)
    pub accepted: bool,
    /// Response classification driving the backoff hint
    pub status: ResponseStatus,
}

/// Delivery seam between the deployer and the device
///
/// The concrete implementation is [`PostManager`]; tests substitute a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DevicePoster: Send + Sync {
    /// POST one declaration, optionally scoped to the given tenants
    async fn post(&self, declaration: String, tenants: Option<Vec<String>>) -> PostOutcome;
}

/// A response field by key, with a null stand-in for absent ones
///
/// Bound outside the tracing macros: a bare `Value::Null` inside a field
/// expression resolves to the `tracing::field::Value` trait instead of
/// the serde_json enum.
fn response_field<'a>(object: &'a Value, key: &str) -> &'a Value {
    static NULL: Value = Value::Null;
    object.get(key).unwrap_or(&NULL)
}

/// Classify a parsed device response
///
/// Only the HTTP status governs the verdict; per-tenant results embedded
/// in a 2xx body are logged individually but do not change it.
pub fn classify_response(status_code: u16, body: &Value) -> PostOutcome {
    match status_code {
        200..=299 => {
            if let Some(results) = body.get("results").and_then(Value::as_array) {
                for result in results {
                    debug!(
                        code = %response_field(result, "code"),
                        tenant = %response_field(result, "tenant"),
                        message = %response_field(result, "message"),
                        "device result"
                    );
                }
            }
            PostOutcome {
                accepted: true,
                status: ResponseStatus::Ok,
            }
        }
        503 => {
            error!(
                code = %response_field(body, "code"),
                "device busy, declaration will be re-posted"
            );
            PostOutcome {
                accepted: false,
                status: ResponseStatus::ServiceUnavailable,
            }
        }
        404 => {
            let code = body
                .pointer("/error/code")
                .cloned()
                .unwrap_or(Value::from(404));
            error!(code = %code, "device responded not found");
            PostOutcome {
                accepted: true,
                status: ResponseStatus::NotFound,
            }
        }
        _ => {
            if let Some(results) = body.get("results").and_then(Value::as_array) {
                for result in results {
                    error!(
                        code = %response_field(result, "code"),
                        tenant = %response_field(result, "tenant"),
                        message = %response_field(result, "message"),
                        "device error result"
                    );
                }
            } else if let Some(code) = body.pointer("/error/code") {
                error!(code = %code, "device responded with error");
            } else {
                error!(code = %response_field(body, "code"), "device responded with code");
            }
            PostOutcome {
                accepted: false,
                status: ResponseStatus::Common,
            }
        }
    }
}

/// Parse a device-reported AS3 version string ("3.18.1") into major.minor
pub fn parse_version(version: &str) -> Result<f64> {
    let mut parts = version.split('.');
    let major_minor = match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("{}.{}", major, minor),
        (Some(major), None) => major.to_string(),
        _ => String::new(),
    };
    major_minor
        .parse::<f64>()
        .map_err(|_| Error::unsupported_version(format!("unparsable version '{}'", version)))
}

/// POSTs unified declarations to the device's declarative endpoint
///
/// The HTTP client is stateless per request and safely reusable across
/// attempts; it is built once at construction.
pub struct PostManager {
    client: reqwest::Client,
    params: PostParams,
}

impl PostManager {
    /// Build the delivery client from the given parameters
    ///
    /// Installs the extra trusted CA bundle when configured and applies
    /// the hard per-request transport timeout.
    pub fn new(params: PostParams) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(params.ssl_insecure);

        if let Some(pem) = &params.trusted_certs {
            let certs = reqwest::Certificate::from_pem_bundle(pem.as_bytes())
                .map_err(|e| Error::http(format!("invalid trusted CA bundle: {}", e)))?;
            if certs.is_empty() {
                return Err(Error::http("trusted CA bundle contains no certificates"));
            }
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, params })
    }

    /// Declarative endpoint URL, optionally scoped to the given tenants
    pub fn declare_url(&self, tenants: Option<&[String]>) -> String {
        let scope = tenants.map(|t| t.join(",")).unwrap_or_default();
        format!("{}{}/{}", self.params.device_url, AS3_DECLARE_PATH, scope)
    }

    /// Preflight: verify the device runs a compatible AS3 service version
    pub async fn verify_appservices(&self) -> Result<()> {
        let url = format!("{}{}", self.params.device_url, AS3_INFO_PATH);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.params.username, Some(&self.params.password))
            .send()
            .await
            .map_err(|e| Error::http(format!("AS3 info request failed: {}", e)))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::http(format!("AS3 info response malformed: {}", e)))?;

        let reported = body
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::unsupported_version("device reported no AS3 version"))?;

        let version = parse_version(reported)?;
        if version >= AS3_MIN_SUPPORTED_VERSION {
            debug!(version = reported, "device AS3 service version accepted");
            Ok(())
        } else {
            Err(Error::unsupported_version(format!(
                "device AS3 version {} is below the supported minimum {}",
                reported, AS3_MIN_SUPPORTED_VERSION
            )))
        }
    }

    async fn execute(&self, url: &str, declaration: String) -> Option<(u16, Value)> {
        let response = match self
            .client
            .post(url)
            .basic_auth(&self.params.username, Some(&self.params.password))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(declaration)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "REST call error");
                return None;
            }
        };

        let status = response.status().as_u16();
        let raw = match response.text().await {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "REST call response error");
                return None;
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(body) => Some((status, body)),
            Err(e) => {
                error!(error = %e, "response body parse failed");
                if self.params.log_response {
                    error!(raw = %raw, "raw response from device");
                }
                None
            }
        }
    }
}

#[async_trait]
impl DevicePoster for PostManager {
    async fn post(&self, declaration: String, tenants: Option<Vec<String>>) -> PostOutcome {
        let url = self.declare_url(tenants.as_deref());
        debug!(url = %url, "posting declaration");

        match self.execute(&url, declaration).await {
            Some((status, body)) => {
                let outcome = classify_response(status, &body);
                if !outcome.accepted && self.params.log_response {
                    error!(raw = %body, "raw response from device");
                }
                outcome
            }
            // Transport error or malformed body
            None => PostOutcome {
                accepted: false,
                status: ResponseStatus::Common,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    // ==========================================================================
    // Story: Response Classification
    //
    // Only the HTTP status governs accept/reject; body contents are logged
    // but never change the verdict.
    // ==========================================================================

    #[test]
    fn two_hundreds_are_accepted_without_retry() {
        for status in [200, 201, 202] {
            let outcome = classify_response(
                status,
                &json!({ "results": [{ "code": 200, "tenant": "Finance", "message": "success" }] }),
            );
            assert!(outcome.accepted);
            assert_eq!(outcome.status, ResponseStatus::Ok);
            assert_eq!(retry_delay(outcome.status), Duration::ZERO);
        }
    }

    #[test]
    fn tenant_level_errors_inside_a_2xx_do_not_reject() {
        let outcome = classify_response(
            200,
            &json!({ "results": [{ "code": 422, "tenant": "Finance", "message": "invalid" }] }),
        );
        assert!(outcome.accepted, "HTTP status governs the verdict");
    }

    /// Result entries may omit any of code/tenant/message; classification
    /// (and the per-result logging) must tolerate the gaps.
    #[test]
    fn partial_result_entries_do_not_affect_classification() {
        let outcome = classify_response(200, &json!({ "results": [{ "code": 200 }, {}] }));
        assert!(outcome.accepted);

        let outcome = classify_response(500, &json!({ "results": [{}] }));
        assert!(!outcome.accepted);
        assert_eq!(outcome.status, ResponseStatus::Common);
    }

    #[test]
    fn not_found_is_accepted_but_flagged() {
        let outcome = classify_response(404, &json!({ "error": { "code": 404 } }));
        assert!(outcome.accepted);
        assert_eq!(outcome.status, ResponseStatus::NotFound);
        assert_eq!(retry_delay(outcome.status), Duration::ZERO);
    }

    #[test]
    fn service_unavailable_retries_after_three_seconds() {
        let outcome = classify_response(503, &json!({ "code": 503 }));
        assert!(!outcome.accepted);
        assert_eq!(outcome.status, ResponseStatus::ServiceUnavailable);
        assert_eq!(retry_delay(outcome.status), RETRY_DELAY_BUSY);
    }

    #[test]
    fn unknown_statuses_retry_after_thirty_seconds() {
        for (status, body) in [
            (422, json!({ "results": [{ "code": 422, "tenant": "x", "message": "declaration failed" }] })),
            (500, json!({ "error": { "code": 500, "message": "boom" } })),
            (401, json!({ "code": 401 })),
        ] {
            let outcome = classify_response(status, &body);
            assert!(!outcome.accepted);
            assert_eq!(outcome.status, ResponseStatus::Common);
            assert_eq!(retry_delay(outcome.status), RETRY_DELAY_OTHER);
        }
    }

    // ==========================================================================
    // Story: Endpoint Construction and Version Preflight
    // ==========================================================================

    #[test]
    fn declare_url_joins_tenants_with_commas() {
        let manager = PostManager::new(PostParams {
            device_url: "https://192.168.10.2".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            manager.declare_url(None),
            "https://192.168.10.2/mgmt/shared/appsvcs/declare/"
        );
        assert_eq!(
            manager.declare_url(Some(&["Finance".to_string(), "HR".to_string()])),
            "https://192.168.10.2/mgmt/shared/appsvcs/declare/Finance,HR"
        );
    }

    #[test]
    fn version_strings_parse_to_major_minor() {
        assert_eq!(parse_version("3.18.1").unwrap(), 3.18);
        assert_eq!(parse_version("3.18").unwrap(), 3.18);
        assert_eq!(parse_version("3").unwrap(), 3.0);
        assert!(parse_version("latest").is_err());
        assert!(parse_version("").is_err());
    }

    #[test]
    fn version_floor_matches_supported_minimum() {
        assert!(parse_version("3.18.0").unwrap() >= AS3_MIN_SUPPORTED_VERSION);
        assert!(parse_version("3.50.2").unwrap() >= AS3_MIN_SUPPORTED_VERSION);
        assert!(parse_version("3.17.9").unwrap() < AS3_MIN_SUPPORTED_VERSION);
    }

    #[test]
    fn client_construction_rejects_garbage_ca_bundles() {
        let result = PostManager::new(PostParams {
            trusted_certs: Some("not a pem".to_string()),
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Http(_))));
    }
}
