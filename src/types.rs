//! Data model shared across the agent
//!
//! The upstream reconciliation layer produces a [`DesiredState`] snapshot:
//! the resource-derived declaration fragment, zero or more named
//! configuration-fragment updates, and an endpoint-discovery capability.
//! Requests into the delivery pipeline and responses out of it are closed
//! tagged unions validated once at the mailbox boundary.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{FRAGMENT_LABEL_OVERRIDE, FRAGMENT_LABEL_USER, FRAGMENT_MARKER_LABEL};

/// One pool member, uniquely identified by (address, port)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Endpoint IP address or hostname
    pub address: String,
    /// Endpoint service port
    pub port: u16,
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Endpoint discovery capability supplied with each snapshot
///
/// Resolves a pool selector to the currently known service endpoints.
/// Discovery internals live upstream; the builder only consumes the result.
#[cfg_attr(test, automock)]
pub trait EndpointDiscovery: Send + Sync {
    /// Look up the members currently backing the given selector
    fn lookup(&self, selector: &str) -> Vec<Member>;
}

/// Label selector key for the tenant a pool belongs to
pub const SELECTOR_TENANT_LABEL: &str = "cis.f5.com/as3-tenant=";
/// Label selector key for the application a pool belongs to
pub const SELECTOR_APP_LABEL: &str = "cis.f5.com/as3-app=";
/// Label selector key for the pool name
pub const SELECTOR_POOL_LABEL: &str = "cis.f5.com/as3-pool=";

/// Build the discovery selector for a (tenant, application, pool) triple
pub fn pool_selector(tenant: &str, app: &str, pool: &str) -> String {
    format!(
        "{}{},{}{},{}{}",
        SELECTOR_TENANT_LABEL, tenant, SELECTOR_APP_LABEL, app, SELECTOR_POOL_LABEL, pool
    )
}

/// Operation carried by a configuration-fragment update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOp {
    /// Create or update the fragment from the carried payload
    Update,
    /// Remove the fragment and its device-side partitions
    Delete,
}

/// Which of the two tracked fragments an update addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentKind {
    /// The user-defined declaration template
    User,
    /// The override declaration merged on top of the unified document
    Override,
}

/// One named configuration-fragment update from the reconciliation layer
#[derive(Clone, Debug)]
pub struct FragmentUpdate {
    /// Source object name
    pub name: String,
    /// Source object namespace
    pub namespace: String,
    /// Label set used to classify the fragment (user-defined vs override)
    pub labels: BTreeMap<String, String>,
    /// Update or Delete
    pub op: UpdateOp,
    /// Raw declaration payload (empty for deletes)
    pub data: String,
}

impl FragmentUpdate {
    /// Classify this update by its labels
    ///
    /// The marker label must be present with the expected value; the
    /// override label wins over the user label when both are set.
    pub fn classify(&self) -> Option<FragmentKind> {
        let (marker_key, marker_value) = FRAGMENT_MARKER_LABEL;
        if self.labels.get(marker_key).map(String::as_str) != Some(marker_value) {
            return None;
        }
        if self.labels.get(FRAGMENT_LABEL_OVERRIDE).map(String::as_str) == Some("true") {
            return Some(FragmentKind::Override);
        }
        if self.labels.get(FRAGMENT_LABEL_USER).map(String::as_str) == Some("true") {
            return Some(FragmentKind::User);
        }
        None
    }
}

/// Desired-state snapshot produced by the upstream reconciliation layer
#[derive(Clone)]
pub struct DesiredState {
    /// Resource-derived declaration fragment: tenant objects keyed by
    /// tenant name, built from cluster resources directly (not a template)
    pub tenants: Option<Map<String, Value>>,
    /// Named configuration-fragment updates carried by this snapshot
    pub fragments: Vec<FragmentUpdate>,
    /// Endpoint discovery capability for pool-member resolution
    pub discovery: Arc<dyn EndpointDiscovery>,
}

impl fmt::Debug for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredState")
            .field("tenants", &self.tenants.as_ref().map(Map::len))
            .field("fragments", &self.fragments.len())
            .finish()
    }
}

impl DesiredState {
    /// Create an empty snapshot with the given discovery capability
    pub fn new(discovery: Arc<dyn EndpointDiscovery>) -> Self {
        Self {
            tenants: None,
            fragments: Vec::new(),
            discovery,
        }
    }
}

/// Request into the delivery pipeline
///
/// A closed tagged union: the runtime-typed payload dispatch of older
/// designs is replaced by explicit variants validated at the mailbox
/// boundary.
#[derive(Clone, Debug)]
pub enum Request {
    /// Deliver the unified declaration to the device
    SendDeclaration(DesiredState),
    /// Push forwarding-database records to the downstream consumer
    SendFdb(DesiredState),
    /// Push ARP/admission state to the downstream consumer
    SendArp(DesiredState),
}

/// Outcome event reported to the downstream admission-status consumer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    /// Whether the device admitted the configuration
    pub admitted: bool,
    /// Whether forwarding-database records should be written
    pub fdb_requested: bool,
    /// Set of currently known pool members
    pub members: HashSet<Member>,
}
