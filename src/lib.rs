//! as3-sync - declarative configuration synchronization for AS3-capable ADCs
//!
//! This crate converts an already-computed desired-state snapshot of
//! load-balancing resources into a single declarative AS3 document and
//! reliably delivers it to a remote application delivery controller over
//! REST, absorbing device busy/error responses, duplicate submissions, and
//! bursts of updates.
//!
//! # Architecture
//!
//! A single dedicated worker task per agent instance (the deployer) drains
//! a one-slot coalescing mailbox of requests. It is the exclusive mutator
//! of all configuration state, so no locks are needed on that state:
//!
//! - An upstream reconciler pushes [`types::Request`] snapshots into the
//!   inbound mailbox (newest request overwrites a not-yet-consumed one)
//! - The deployer debounces bursts, merges the template, the discovered
//!   endpoints, and the override fragment into one unified declaration
//! - The [`postmgr::PostManager`] performs one HTTP POST per attempt and
//!   classifies the response into a fixed taxonomy
//! - Rejections are retried on a classified backoff, unless a newer
//!   request arrives first (last-write-wins pre-emption)
//! - Outcomes are reported downstream through a one-slot outbound mailbox
//!
//! # Modules
//!
//! - [`agent`] - Backend facade (declarative vs legacy imperative)
//! - [`builder`] - Declaration unification pipeline and collaborator traits
//! - [`config`] - Agent and delivery construction parameters
//! - [`declaration`] - AS3 document helpers (tenants, pools, controls)
//! - [`deployer`] - The single-writer delivery worker
//! - [`error`] - Error types
//! - [`fragment`] - Configuration-fragment state machine
//! - [`mailbox`] - Single-slot overwrite-on-contention mailbox
//! - [`notifier`] - Outbound response reporting
//! - [`postmgr`] - HTTP delivery and response classification
//! - [`types`] - Data model shared across the crate

#![deny(missing_docs)]

pub mod agent;
pub mod builder;
pub mod config;
pub mod declaration;
pub mod deployer;
pub mod error;
pub mod fragment;
pub mod mailbox;
pub mod notifier;
pub mod postmgr;
pub mod types;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralized so that config defaults, the deployer, and test fixtures agree.

/// AS3 schema version the agent declares and validates against
pub const AS3_SCHEMA_VERSION: &str = "3.18.0";

/// Minimum AS3 service version the device must be running
pub const AS3_MIN_SUPPORTED_VERSION: f64 = 3.18;

/// Base path of the device's declarative configuration endpoint
pub const AS3_DECLARE_PATH: &str = "/mgmt/shared/appsvcs/declare";

/// Path of the device's AS3 service info endpoint (version preflight)
pub const AS3_INFO_PATH: &str = "/mgmt/shared/appsvcs/info";

/// Marker label a configuration fragment must carry to be considered at all
pub const FRAGMENT_MARKER_LABEL: (&str, &str) = ("f5type", "virtual-server");

/// Label identifying the user-defined declaration fragment
pub const FRAGMENT_LABEL_USER: &str = "as3";

/// Label identifying the override declaration fragment
pub const FRAGMENT_LABEL_OVERRIDE: &str = "overrideAS3";

/// Suffix appended to the base partition to form the agent-managed partition
pub const MANAGED_PARTITION_SUFFIX: &str = "_AS3";
