//! Configuration-fragment state machine
//!
//! The agent tracks exactly two configuration fragments: the user-defined
//! declaration template and the override declaration. Each owns an
//! identity binding, an `Init -> Active -> Error -> Init` lifecycle (plus
//! `Active -> DeletePending -> Init` for deletions whose remote partition
//! delete failed), and the structural-equality idempotence guards that
//! keep resubmitted duplicates from triggering rebuilds.
//!
//! Fragments are created at agent start and mutated exclusively by the
//! deployer worker; they are never destroyed while the agent runs.

use serde_json::Value;
use tracing::debug;

use crate::declaration::json_equal;
use crate::error::Error;
use crate::Result;

/// Lifecycle state of a configuration fragment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragmentState {
    /// No configuration built yet (start state, and the reset target)
    Init,
    /// Last observed payload built successfully
    Active,
    /// Last observed payload failed to build; identical resubmissions are
    /// ignored until the input changes
    Error,
    /// Deletion observed but the remote partition delete failed; retried
    /// until it succeeds
    DeletePending,
}

/// One independently tracked configuration source
#[derive(Clone, Debug)]
pub struct ConfigFragment {
    name: String,
    namespace: String,
    /// Statically configured source locator, if any: (namespace, name)
    source: Option<(String, String)>,
    state: FragmentState,
    /// Last observed raw payload (kept for the idempotence guards)
    raw: String,
    /// Last successfully built declaration
    declaration: Option<Value>,
}

impl ConfigFragment {
    /// Create a fragment, optionally bound to a static `namespace/name`
    /// source locator from configuration
    ///
    /// A statically configured identity never changes; an unconfigured
    /// fragment binds to the first observed identity instead.
    pub fn new(source: Option<&str>) -> Self {
        let source = source.and_then(|locator| {
            let mut parts = locator.splitn(2, '/');
            match (parts.next(), parts.next()) {
                (Some(namespace), Some(name)) if !namespace.is_empty() && !name.is_empty() => {
                    Some((namespace.to_string(), name.to_string()))
                }
                _ => None,
            }
        });
        let (namespace, name) = source.clone().unwrap_or_default();
        Self {
            name,
            namespace,
            source,
            state: FragmentState::Init,
            raw: String::new(),
            declaration: None,
        }
    }

    /// Bind the fragment to an observed (name, namespace) identity
    ///
    /// Accepts only the statically configured identity when one exists.
    /// Otherwise the first observed identity binds; later observations
    /// with a different identity are rejected (strict rebinding policy)
    /// with [`Error::NotConfigured`].
    pub fn bind(&mut self, name: &str, namespace: &str) -> Result<()> {
        if let Some((src_namespace, src_name)) = &self.source {
            if src_name == name && src_namespace == namespace {
                self.name = name.to_string();
                self.namespace = namespace.to_string();
                return Ok(());
            }
            return Err(Error::not_configured(format!(
                "{}/{} (configured source is {}/{})",
                namespace, name, src_namespace, src_name
            )));
        }

        if self.name.is_empty() && self.namespace.is_empty() {
            self.name = name.to_string();
            self.namespace = namespace.to_string();
            debug!(name, namespace, "bound fragment to first observed source");
            return Ok(());
        }

        if self.name == name && self.namespace == namespace {
            return Ok(());
        }
        Err(Error::not_configured(format!(
            "{}/{} (bound source is {}/{})",
            namespace, name, self.namespace, self.name
        )))
    }

    /// Whether the given identity matches the fragment's current binding
    pub fn matches(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    /// Source object name the fragment is bound to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source object namespace the fragment is bound to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current lifecycle state
    pub fn state(&self) -> FragmentState {
        self.state
    }

    /// Guard: in Error state with a structurally identical payload
    ///
    /// A fragment in Error ignores a resubmission that is JSON-equal to
    /// the payload that caused the error; reprocessing it would fail the
    /// same way.
    pub fn in_error_state(&self, data: &str) -> bool {
        self.state == FragmentState::Error && json_equal(&self.raw, data)
    }

    /// Guard: already built this payload successfully
    pub fn already_processed(&self, data: &str) -> bool {
        self.state == FragmentState::Active && json_equal(&self.raw, data)
    }

    /// Whether a remote partition delete is still pending for this fragment
    pub fn is_delete_pending(&self) -> bool {
        self.state == FragmentState::DeletePending
    }

    /// Record the raw payload about to be built
    ///
    /// Staged before building so that a build failure leaves the failing
    /// payload in place for the Error-state guard.
    pub fn stage(&mut self, raw: String) {
        self.raw = raw;
    }

    /// Last staged raw payload
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Store the built declaration
    pub fn set_declaration(&mut self, declaration: Value) {
        self.declaration = Some(declaration);
    }

    /// Last successfully built declaration, if any
    pub fn declaration(&self) -> Option<&Value> {
        self.declaration.as_ref()
    }

    /// Transition to Active
    pub fn mark_active(&mut self) {
        self.state = FragmentState::Active;
    }

    /// Transition to Error
    pub fn mark_error(&mut self) {
        self.state = FragmentState::Error;
    }

    /// Transition to DeletePending
    pub fn mark_delete_pending(&mut self) {
        self.state = FragmentState::DeletePending;
    }

    /// Reset to Init: clears payloads and, unless the identity is
    /// statically configured, the identity binding as well
    pub fn reset(&mut self) {
        self.raw.clear();
        self.declaration = None;
        self.state = FragmentState::Init;
        match &self.source {
            Some((namespace, name)) => {
                self.namespace = namespace.clone();
                self.name = name.clone();
            }
            None => {
                self.name.clear();
                self.namespace.clear();
            }
        }
    }
}
