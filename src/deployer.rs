//! The single-writer delivery worker
//!
//! One deployer task owns all configuration state for an agent instance:
//! the two tracked fragments, the last committed delivery, and the
//! retry/debounce machinery. It drains the inbound one-slot mailbox, so
//! bursts coalesce into the newest snapshot and no locks guard the state.
//!
//! Delivery cycle, in order:
//!
//! 1. apply fragment updates (binding, idempotence guards, validation)
//! 2. compose the unified declaration: template, resource tenants,
//!    discovered pool members, controls, override merge
//! 3. delete device partitions for tenants that disappeared
//! 4. skip the POST when the document is structurally unchanged
//! 5. request forwarding-database records, POST, and on acceptance commit
//!    the delivery and report admission
//!
//! The committed state only advances on an accepted delivery; a rejected
//! cycle is retried from the same snapshot after the classified backoff,
//! unless a newer snapshot arrives first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::builder::{fill_pool_members, parse_template, stale_tenants, OverrideMerger, SchemaValidator};
use crate::config::AgentParams;
use crate::error::Error;
use crate::declaration::{
    base_declaration, empty_declaration, find_reserved_tenant, inject_controls, overlay_tenants,
    reserved_partitions, tenants,
};
use crate::fragment::{ConfigFragment, FragmentState};
use crate::mailbox::Mailbox;
use crate::notifier::Notifier;
use crate::postmgr::{retry_delay, DevicePoster};
use crate::types::{DesiredState, FragmentKind, Member, Request, UpdateOp};

/// Last delivery the device accepted
#[derive(Default)]
struct Committed {
    unified: Option<Value>,
    tenants: Vec<String>,
    members: HashSet<Member>,
}

/// Delivery worker; consumed by [`Deployer::run`]
pub struct Deployer {
    device: Arc<dyn DevicePoster>,
    validator: Option<Arc<dyn SchemaValidator>>,
    merger: Arc<dyn OverrideMerger>,
    notifier: Notifier,
    params: AgentParams,
    user: ConfigFragment,
    override_frag: ConfigFragment,
    active: Committed,
    /// Snapshot of the last rejected cycle, retried after its backoff
    pending_state: Option<DesiredState>,
}

impl Deployer {
    /// Create a worker delivering through `device` and reporting through
    /// `notifier`
    pub fn new(
        device: Arc<dyn DevicePoster>,
        merger: Arc<dyn OverrideMerger>,
        notifier: Notifier,
        params: AgentParams,
    ) -> Self {
        let user = ConfigFragment::new(params.user_source.as_deref());
        let override_frag = ConfigFragment::new(params.override_source.as_deref());
        Self {
            device,
            validator: None,
            merger,
            notifier,
            params,
            user,
            override_frag,
            active: Committed::default(),
            pending_state: None,
        }
    }

    /// Install a schema validator applied to user templates before building
    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Drain the inbound mailbox until it is closed
    ///
    /// The first request is delivered immediately; every later request is
    /// debounced by the configured delay, and the newest snapshot wins the
    /// debounce window. A rejected delivery is retried after its
    /// classified backoff unless a newer request pre-empts it.
    pub async fn run(mut self, inbound: Mailbox<Request>) {
        let mut first = true;
        let mut retry_after: Option<Duration> = None;

        loop {
            let (mut request, debounce) = if let Some(delay) = retry_after.take() {
                tokio::select! {
                    request = inbound.recv() => match request {
                        Some(request) => (request, !first),
                        None => return,
                    },
                    _ = sleep(delay) => match self.pending_state.clone() {
                        Some(state) => {
                            info!("retrying rejected delivery");
                            (Request::SendDeclaration(state), false)
                        }
                        None => continue,
                    },
                }
            } else {
                match inbound.recv().await {
                    Some(request) => (request, !first),
                    None => return,
                }
            };

            if debounce && !self.params.post_delay.is_zero() {
                sleep(self.params.post_delay).await;
                if let Some(newer) = inbound.try_recv() {
                    debug!("newer request arrived during debounce, superseding");
                    request = newer;
                }
            }
            first = false;

            retry_after = self.handle(request).await;
        }
    }

    /// Process one request; `Some(delay)` asks the loop to retry after it
    async fn handle(&mut self, request: Request) -> Option<Duration> {
        match request {
            Request::SendDeclaration(state) => {
                let delay = self.deliver(&state).await;
                self.pending_state = delay.is_some().then(|| state);
                delay
            }
            Request::SendFdb(_) => {
                self.notifier.send_fdb_records(self.active.members.clone());
                None
            }
            Request::SendArp(_) => {
                self.notifier.send_admission(self.active.members.clone());
                None
            }
        }
    }

    async fn deliver(&mut self, state: &DesiredState) -> Option<Duration> {
        self.apply_fragment_updates(state);

        // Compose the unified declaration
        let mut unified = match self.user.declaration() {
            Some(template) => template.clone(),
            None => base_declaration(),
        };
        if let Some(resource_tenants) = &state.tenants {
            overlay_tenants(&mut unified, resource_tenants);
        }
        let members = fill_pool_members(&mut unified, state.discovery.as_ref(), &self.active.members);
        inject_controls(&mut unified, &self.params.user_agent);
        self.apply_override(&mut unified);

        let current_tenants = tenants(&unified);

        // Partitions that disappeared must be deleted on device first.
        // Issuing any delete changes the device, so the committed document
        // no longer describes it and the no-op guard below must not fire.
        let stale = stale_tenants(&self.active.tenants, &current_tenants);
        if !stale.is_empty() {
            self.active.unified = None;
        }
        if let Some(delay) = self.delete_partitions(&stale).await {
            self.user.mark_delete_pending();
            return Some(delay);
        }
        self.active.tenants.retain(|t| current_tenants.contains(t));
        if self.user.is_delete_pending() {
            if self.user.declaration().is_some() {
                self.user.mark_active();
            } else {
                self.user.reset();
            }
        }

        if current_tenants.is_empty() {
            // Nothing left to declare: deliver the bare managed-partition
            // shell so the device drops whatever it still holds
            debug!("no tenants declared, delivering the empty declaration");
            let [managed, _] = reserved_partitions(&self.params.default_partition);
            unified = empty_declaration(&self.params.user_agent, Some(&managed));
        }

        if self.active.unified.as_ref() == Some(&unified) {
            debug!("declaration unchanged, skipping delivery");
            return None;
        }

        // Forwarding-database records must exist before traffic can arrive
        self.notifier.send_fdb_records(members.clone());

        let body = match serde_json::to_string(&unified) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "unified declaration failed to serialize");
                return None;
            }
        };
        let scope = (self.params.filter_tenants && !current_tenants.is_empty())
            .then(|| current_tenants.clone());

        let outcome = self.device.post(body, scope).await;
        if !outcome.accepted {
            return Some(retry_delay(outcome.status));
        }

        let admitted = outcome.status == crate::postmgr::ResponseStatus::Ok;
        self.active = Committed {
            unified: Some(unified),
            tenants: current_tenants,
            members: members.clone(),
        };
        if admitted {
            self.notifier.send_admission(members);
        }
        None
    }

    fn apply_fragment_updates(&mut self, state: &DesiredState) {
        for update in &state.fragments {
            let Some(kind) = update.classify() else {
                debug!(
                    name = %update.name,
                    namespace = %update.namespace,
                    "fragment update carries no recognized labels, ignoring"
                );
                continue;
            };
            match kind {
                FragmentKind::User => Self::apply_user_update(
                    &mut self.user,
                    update,
                    self.params.schema_validation,
                    self.validator.as_deref(),
                    &self.params.default_partition,
                ),
                FragmentKind::Override => Self::apply_override_update(&mut self.override_frag, update),
            }
        }
    }

    fn apply_user_update(
        fragment: &mut ConfigFragment,
        update: &crate::types::FragmentUpdate,
        schema_validation: bool,
        validator: Option<&dyn SchemaValidator>,
        default_partition: &str,
    ) {
        if let Err(e) = fragment.bind(&update.name, &update.namespace) {
            warn!(name = %update.name, namespace = %update.namespace, error = %e, "ignoring fragment update");
            return;
        }
        if update.op == UpdateOp::Delete {
            info!(name = %update.name, "user declaration deleted, clearing template");
            fragment.reset();
            return;
        }
        if fragment.in_error_state(&update.data) {
            debug!(name = %update.name, "payload unchanged since last error, ignoring");
            return;
        }
        if fragment.already_processed(&update.data) {
            debug!(name = %update.name, "payload already processed, ignoring");
            return;
        }

        fragment.stage(update.data.clone());

        if let Err(e) = Self::build_user_template(
            fragment,
            &update.data,
            schema_validation,
            validator,
            default_partition,
        ) {
            warn!(name = %update.name, error = %e, "template rejected");
            fragment.mark_error();
        }
    }

    /// Validate and parse a staged payload into the fragment's declaration
    fn build_user_template(
        fragment: &mut ConfigFragment,
        data: &str,
        schema_validation: bool,
        validator: Option<&dyn SchemaValidator>,
        default_partition: &str,
    ) -> crate::Result<()> {
        if schema_validation {
            if let Some(validator) = validator {
                if !validator.validate(data) {
                    return Err(Error::validation("template failed schema validation"));
                }
            }
        }

        let template = parse_template(data)?;

        if let Some(reserved) = find_reserved_tenant(&template, default_partition) {
            return Err(Error::reserved_partition(reserved));
        }

        fragment.set_declaration(template);
        fragment.mark_active();
        Ok(())
    }

    fn apply_override_update(fragment: &mut ConfigFragment, update: &crate::types::FragmentUpdate) {
        if let Err(e) = fragment.bind(&update.name, &update.namespace) {
            warn!(name = %update.name, namespace = %update.namespace, error = %e, "ignoring fragment update");
            return;
        }
        if update.op == UpdateOp::Delete {
            info!(name = %update.name, "override declaration deleted");
            fragment.reset();
            return;
        }
        if fragment.in_error_state(&update.data) || fragment.already_processed(&update.data) {
            debug!(name = %update.name, "override payload unchanged, ignoring");
            return;
        }

        fragment.stage(update.data.clone());
        match parse_template(&update.data) {
            Ok(decl) => {
                fragment.set_declaration(decl);
                fragment.mark_active();
            }
            Err(e) => {
                warn!(name = %update.name, error = %e, "override rejected");
                fragment.mark_error();
            }
        }
    }

    /// Merge the override declaration onto the unified document
    ///
    /// An override fragment in Error state is skipped. A failed merge is
    /// non-fatal: the unified document is delivered without the override
    /// and the override fragment enters Error.
    fn apply_override(&mut self, unified: &mut Value) {
        if self.override_frag.state() == FragmentState::Error {
            return;
        }
        let Some(override_decl) = self.override_frag.declaration() else {
            return;
        };
        match self.merger.merge(override_decl, unified) {
            Some(merged) => {
                *unified = merged;
                self.override_frag.mark_active();
            }
            None => {
                warn!("override merge failed, delivering without override");
                self.override_frag.mark_error();
            }
        }
    }

    /// Delete the given partitions on device, one empty shell per POST
    ///
    /// Stops at the first rejection and reports its backoff; partitions
    /// already deleted are not re-attempted by the caller because an
    /// empty-shell re-post is idempotent anyway.
    async fn delete_partitions(&mut self, partitions: &[String]) -> Option<Duration> {
        for partition in partitions {
            info!(partition = %partition, "deleting stale partition");
            let decl = empty_declaration(&self.params.user_agent, Some(partition));
            let body = match serde_json::to_string(&decl) {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "empty declaration failed to serialize");
                    return None;
                }
            };
            let scope = self.params.filter_tenants.then(|| vec![partition.clone()]);
            let outcome = self.device.post(body, scope).await;
            if !outcome.accepted {
                warn!(partition = %partition, "partition delete rejected, will retry");
                return Some(retry_delay(outcome.status));
            }
        }
        None
    }
}
