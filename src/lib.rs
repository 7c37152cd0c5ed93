//! `forestwatch`: hazard incident tracking for LoRaWAN forest sensor nodes.
//!
//! Uplinks are normalized into one canonical record, persisted, and run
//! through a per-(node, hazard) incident lifecycle. Dashboards follow the
//! results over a WebSocket event stream and query history over HTTP.
//!
//! Module layout follows the Explicit Module Boundary Pattern (EMBP): each
//! module exposes a small surface re-exported here, and `main.rs` only wires
//! them together.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fanout;
pub mod maintenance;
pub mod models;
pub mod normalize;
pub mod routes;
pub mod schema;
pub mod store;

pub use config::{Config, StoreBackend};
pub use engine::{CooldownPolicy, EngineSettings, IncidentEngine, IngestOutcome};
pub use error::{ApiError, IngestError, NormalizationError, StoreError};
pub use events::Event;
pub use fanout::{Fanout, Publisher, Subscription};
pub use models::{HazardType, Incident, IncidentGroup, NodeStatus, Reading, SensorNode, Severity};
pub use normalize::{normalize, NormalizedIngestion};
pub use routes::AppState;
pub use store::{IncidentStore, MemoryStore, PgStore};
