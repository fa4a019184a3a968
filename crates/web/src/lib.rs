//! vmrunner Web Panel
//!
//! Serves the operator panel for one excloud compute VM: session gate,
//! status reconciliation against the compute service, and power actions
//! with post-action re-polling.

pub mod auth;
pub mod compute;
pub mod server;

pub use compute::{ComputeClient, ComputeConfig, ControlPanel};
pub use server::{WebServer, WebServerConfig};
