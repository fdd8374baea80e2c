pub mod client;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod id_mapping;
pub mod importer;
pub mod models;
pub mod queue;
pub mod reconcile;
pub mod storage;
pub mod sync;
pub mod transport;

pub use client::{Backend, BackendClient};
pub use config::{ApiConfig, MatchTolerances, SyncConfig};
pub use connectivity::ConnectivityMonitor;
pub use error::{ApiError, ApiResult};
pub use storage::LocalStore;
pub use sync::{NoopNotifier, SyncEngine, SyncNotifier, SyncState, SyncSummary, TracingNotifier};
