pub mod artifacts;
pub mod config;
pub mod engine;
pub mod error;
pub mod launch;
pub mod measurement;
pub mod routes;
pub mod shutdown;
pub mod state;
pub mod store;

pub use config::{service_config_from_env, ServiceConfig};
pub use state::AppState;
