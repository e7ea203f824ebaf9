//! # Muster Core
//!
//! Core library for the Muster fleet inventory engine: scheduled inventory
//! synchronization, remote command dispatch, and fleet server lifecycle
//! management against MDM-style device servers.
//!
//! ## Overview
//!
//! `muster-core` provides:
//!
//! - **Server Registry**: Fleet server onboarding with a connectivity
//!   handshake, service-account provisioning, and cascade removal
//! - **Inventory Sync**: Cron-driven limited and expanded sync passes that
//!   reconcile relational device summaries and wholesale-replace document
//!   snapshots
//! - **Command Dispatch**: Throttled remote command fan-out grouped by
//!   owning server
//! - **Credential Vault**: AES-256-GCM encryption for stored server
//!   credentials, including a destructive one-time emergency read
//! - **Storage Abstraction**: Trait-based stores with PostgreSQL, MongoDB,
//!   and in-memory backends
//!
//! ## Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`engine`]: The [`SyncEngine`] facade wiring everything together
//! - [`registry`]: Fleet server lifecycle operations
//! - [`scheduler`]: Per-server cron job management
//! - [`sync`]: The limited and expanded sync passes
//! - [`dispatch`]: Remote command fan-out
//! - [`store`]: Storage traits and backends
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use muster_core::store::memory::{
//!     MemoryDeviceStore, MemoryServerStore, MemorySnapshotStore,
//! };
//! use muster_core::{CredentialVault, SyncEngine};
//!
//! async fn list_fleet() -> muster_core::Result<()> {
//!     let engine = SyncEngine::builder()
//!         .with_vault(CredentialVault::new("vault passphrase"))
//!         .with_server_store(Arc::new(MemoryServerStore::new()))
//!         .with_device_store(Arc::new(MemoryDeviceStore::new()))
//!         .with_snapshot_store(Arc::new(MemorySnapshotStore::new()))
//!         .build()?;
//!
//!     for server in engine.list_servers().await? {
//!         println!("{} ({})", server.url, server.id);
//!     }
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]

/// HTTP client for fleet server REST APIs, plus the shared client pool
pub mod client;

/// Remote command fan-out to owning fleet servers
pub mod dispatch;

/// Engine facade and builder
pub mod engine;

/// Error types and error handling utilities
pub mod error;

/// Fleet server lifecycle: registration, update, removal, emergency access
pub mod registry;

/// Cron-driven job scheduling per fleet server
pub mod scheduler;

/// Storage traits and the PostgreSQL, MongoDB, and in-memory backends
pub mod store;

/// Limited and expanded inventory sync passes
pub mod sync;

/// Common types shared across the engine
pub mod types;

/// Credential encryption at rest
pub mod vault;

pub use client::{ActivationInfo, ClientError, ClientPool, FetchOptions, FleetClient};
pub use dispatch::{CommandDispatcher, DispatchResult, DispatchStatus};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{EngineError, Result};
pub use registry::{ServerAdded, ServerRegistry, ServerRemoved};
pub use scheduler::{RebuildReport, SkippedSchedule, SyncScheduler};
pub use sync::{FailureScope, SyncFailure, SyncKind, SyncOutcome, SyncRunner};
pub use types::{
    DeviceDescriptor, DeviceRef, DeviceSummary, DeviceType, ExpandedInventory, FleetServer,
    FleetServerSpec, RemoteCommand, ServerId, ServerUpdate,
};
pub use vault::{CredentialVault, VaultError};
