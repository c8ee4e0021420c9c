//! Hestia storage gateway.
//!
//! Mirrors each user's Gaia buckets across their storage connections and
//! presents one reconciled view over them:
//! - `store`: persistence collaborator (users, metadata rows, driver tables)
//! - `index`: metadata index and canonical views
//! - `drivers`: driver registry and scheduler hooks
//! - `connections` / `gaia`: single-connection and fan-out operations
//! - `sync`: read-repair
//! - `handlers`: the axum HTTP surface

pub mod app;
pub mod auth;
pub mod config;
pub mod connections;
pub mod drivers;
pub mod error;
pub mod gaia;
pub mod handlers;
pub mod index;
pub mod store;
pub mod sync;

pub use app::Hestia;
pub use auth::{AuthClaims, Authenticator, TrustingAuthenticator};
pub use config::{Config, GatewaySettings};
pub use connections::{ConnectionService, Registration};
pub use drivers::{DriverConfig, DriverRegistry, MemoryDriver};
pub use error::ApiError;
pub use gaia::GaiaService;
pub use handlers::router;
pub use index::MetadataIndex;
pub use store::{MemoryStore, Store};
pub use sync::{SyncReport, SyncService};
