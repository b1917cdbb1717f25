//! Terrarium - idempotent bring-up for local Kubernetes dev environments
//!
//! Terrarium converges a local multi-service environment (ingress,
//! certificate issuance, a Vault secret store, observability, data stores)
//! against a cluster control plane. Every pass is idempotent: already
//! healthy services are skipped, partial previous runs are picked up where
//! they stand, and the secret store's initialize/unseal/reset machine
//! recovers from any interruption point.
//!
//! # Architecture
//!
//! - Probes are read-only and never fail: unreachable targets collapse into
//!   safe default documents.
//! - A pure classifier maps each probe snapshot to a small health taxonomy;
//!   nothing is memoized, so decisions always reflect live state.
//! - All waiting goes through one bounded polling primitive; chained waits
//!   share a single budget instead of stacking timeouts.
//! - kubectl and helm are invoked, not reimplemented; secrets travel over
//!   stdin, never argument lists.
//!
//! # Modules
//!
//! - [`config`] - Environment description (charts, namespaces, budgets)
//! - [`control_plane`] - Narrow collaborator trait + kubectl/helm impl
//! - [`probe`] - Point-in-time state probes
//! - [`health`] - Snapshot -> health state classification
//! - [`poll`] - Bounded and phase-budgeted waits
//! - [`gate`] - Idempotent deployment gate
//! - [`vault`] - Secret-store lifecycle state machine
//! - [`environment`] - The composing orchestrator
//! - [`registry`] - Step timing records
//! - [`status`] - Background progress ticker
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod control_plane;
pub mod environment;
pub mod error;
pub mod gate;
pub mod health;
pub mod poll;
pub mod probe;
pub mod registry;
pub mod status;
pub mod vault;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
