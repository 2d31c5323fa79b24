//! fleetdeck — client-side control plane for a multi-host container-fleet
//! dashboard.
//!
//! Keeps a local, consistent view of fleet state synchronized from a remote
//! aggregator over a live transport, manages the authenticated session
//! (issuance, refresh, idle expiry, durable persistence), and fans out bulk
//! administrative operations with per-item accounting.

pub mod activity;
pub mod api;
pub mod bulk;
pub mod config;
pub mod error;
pub mod models;
pub mod session;
pub mod storage;
pub mod sync;

pub use activity::{ActivityKind, ActivityMonitor};
pub use api::ApiClient;
pub use bulk::{bulk_update, BulkUpdateFilter};
pub use config::{ClientConfig, TransportKind};
pub use error::{Error, Result};
pub use models::{
    AuthState, AuthTokens, BulkUpdateItem, BulkUpdateReport, Container, ContainerAction,
    ContainerStats, DiskInfo, Host, ImageUpdate, LoginCredentials, LoginOutcome, PortMapping,
    ProfileUpdate, User,
};
pub use session::{is_token_valid, token_expiry, SessionManager};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use sync::{Envelope, FleetSnapshot, LiveSync, SharedSnapshot, SyncHandle};
