//! Supervision of the bundled DB Toolkit backend process.
//!
//! [`BackendSupervisor`] launches the backend, learns its port from the
//! `BACKEND_PORT:<n>` stdout announcement, waits for the health endpoint and
//! hands out the resulting base URL.

pub mod backend_config;
pub mod backend_http;
pub mod backend_launch;
pub mod backend_path;
pub mod backend_readiness;
pub mod backend_supervisor;
pub mod error;
pub mod http_response;
pub mod logging;
pub mod port_discovery;
pub mod process_control;
pub mod supervisor_events;
pub mod supervisor_state;

#[cfg(test)]
mod test_support;

pub use backend_config::SupervisorConfig;
pub use backend_readiness::HealthCheckConfig;
pub use backend_supervisor::BackendSupervisor;
pub use error::SupervisorError;
pub use supervisor_events::{SupervisorEvent, SupervisorSnapshot};
pub use supervisor_state::SupervisorState;
