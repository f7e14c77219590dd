//! Backend facade
//!
//! The host selects a backend flavor once at construction: the declarative
//! backend owns this crate's whole delivery pipeline, while the legacy
//! imperative backend only acknowledges notifier traffic so hosts wired to
//! the older pipeline keep functioning. Dispatch is a trait object chosen
//! by [`BackendKind`]; requests never carry their own routing information.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::builder::{DeclarationMerger, OverrideMerger, SchemaValidator};
use crate::config::AgentParams;
use crate::declaration::empty_declaration;
use crate::deployer::Deployer;
use crate::error::Error;
use crate::mailbox::Mailbox;
use crate::notifier::Notifier;
use crate::postmgr::{DevicePoster, PostManager};
use crate::types::{Request, Response};
use crate::{Result, MANAGED_PARTITION_SUFFIX};

/// Backend flavor selected by the host at construction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Declarative delivery through the unified-declaration pipeline
    Declarative,
    /// Legacy imperative pipeline; this crate only acknowledges it
    Imperative,
}

/// Facade the host drives, independent of the backend flavor
#[async_trait]
pub trait Backend: Send + Sync {
    /// Verify device compatibility and start the delivery worker
    async fn init(&mut self) -> Result<()>;

    /// Queue a request; a newer request replaces an unconsumed one
    fn deploy(&self, request: Request) -> Result<()>;

    /// Remove the managed partition derived from `partition` on the device
    async fn remove(&self, partition: &str) -> Result<()>;

    /// Stop accepting requests, close the outbound side, and await the worker
    async fn teardown(&mut self) -> Result<()>;

    /// Handle to the outbound response mailbox
    fn responses(&self) -> Mailbox<Response>;
}

/// Construct the backend for the given flavor
pub fn create_backend(kind: BackendKind, params: AgentParams) -> Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Declarative => Ok(Box::new(DeclarativeBackend::new(params)?)),
        BackendKind::Imperative => Ok(Box::new(ImperativeBackend::new())),
    }
}

/// The declarative backend: one delivery worker per instance
pub struct DeclarativeBackend {
    device: Arc<dyn DevicePoster>,
    /// Version-preflight handle; absent when a test injects the device seam
    manager: Option<Arc<PostManager>>,
    validator: Option<Arc<dyn SchemaValidator>>,
    merger: Arc<dyn OverrideMerger>,
    params: AgentParams,
    inbound: Mailbox<Request>,
    outbound: Mailbox<Response>,
    worker: Option<JoinHandle<()>>,
}

impl DeclarativeBackend {
    /// Build the backend and its HTTP delivery client
    pub fn new(params: AgentParams) -> Result<Self> {
        let manager = Arc::new(PostManager::new(params.post.clone())?);
        Ok(Self::with_device(
            manager.clone(),
            Some(manager),
            params,
        ))
    }

    fn with_device(
        device: Arc<dyn DevicePoster>,
        manager: Option<Arc<PostManager>>,
        params: AgentParams,
    ) -> Self {
        Self {
            device,
            manager,
            validator: None,
            merger: Arc::new(DeclarationMerger),
            params,
            inbound: Mailbox::new(),
            outbound: Mailbox::new(),
            worker: None,
        }
    }

    /// Install a schema validator applied to user templates
    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Replace the default deep-merge override strategy
    pub fn with_merger(mut self, merger: Arc<dyn OverrideMerger>) -> Self {
        self.merger = merger;
        self
    }
}

#[async_trait]
impl Backend for DeclarativeBackend {
    async fn init(&mut self) -> Result<()> {
        if let Some(manager) = &self.manager {
            manager.verify_appservices().await?;
        }
        if self.worker.is_some() {
            return Ok(());
        }

        let mut deployer = Deployer::new(
            Arc::clone(&self.device),
            Arc::clone(&self.merger),
            Notifier::new(self.outbound.clone()),
            self.params.clone(),
        );
        if let Some(validator) = &self.validator {
            deployer = deployer.with_validator(Arc::clone(validator));
        }
        self.worker = Some(tokio::spawn(deployer.run(self.inbound.clone())));
        info!("delivery worker started");
        Ok(())
    }

    fn deploy(&self, request: Request) -> Result<()> {
        if self.inbound.send(request) {
            Ok(())
        } else {
            Err(Error::ChannelClosed)
        }
    }

    async fn remove(&self, partition: &str) -> Result<()> {
        let managed = format!("{}{}", partition, MANAGED_PARTITION_SUFFIX);
        info!(partition = %managed, "removing managed partition");

        let decl = empty_declaration(&self.params.user_agent, Some(&managed));
        let body = serde_json::to_string(&decl)
            .map_err(|e| Error::serialization(format!("empty declaration: {}", e)))?;
        let outcome = self.device.post(body, None).await;
        if outcome.accepted {
            Ok(())
        } else {
            Err(Error::http(format!("removal of partition {} rejected", managed)))
        }
    }

    async fn teardown(&mut self) -> Result<()> {
        self.inbound.close();
        self.outbound.close();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "delivery worker ended abnormally");
            }
        }
        info!("backend torn down");
        Ok(())
    }

    fn responses(&self) -> Mailbox<Response> {
        self.outbound.clone()
    }
}

/// Legacy imperative backend
///
/// Configuration delivery happens in the older imperative pipeline outside
/// this crate; this backend only keeps the notifier contract alive so the
/// downstream consumer sees FDB/ARP acknowledgements.
pub struct ImperativeBackend {
    notifier: Notifier,
    outbound: Mailbox<Response>,
}

impl Default for ImperativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ImperativeBackend {
    /// Build the acknowledgement-only backend
    pub fn new() -> Self {
        let outbound = Mailbox::new();
        Self {
            notifier: Notifier::new(outbound.clone()),
            outbound,
        }
    }
}

#[async_trait]
impl Backend for ImperativeBackend {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn deploy(&self, request: Request) -> Result<()> {
        match request {
            Request::SendFdb(_) => self.notifier.send_fdb_records(Default::default()),
            Request::SendArp(_) => self.notifier.send_admission(Default::default()),
            Request::SendDeclaration(_) => {
                warn!("imperative backend does not deliver declarations, dropping request");
            }
        }
        Ok(())
    }

    async fn remove(&self, partition: &str) -> Result<()> {
        info!(partition, "partition removal is handled by the imperative pipeline");
        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        self.outbound.close();
        Ok(())
    }

    fn responses(&self) -> Mailbox<Response> {
        self.outbound.clone()
    }
}
