//! Process orchestration for dev-tool sidecars.
//!
//! Two cooperating pieces, meant to sit below a request layer and above
//! raw OS process primitives:
//!
//! - [`ServiceSupervisor`] ensures a named external HTTP service is up
//!   and reachable: health-check polling, on-demand spawn with a start
//!   timeout, and single-flight deduplication so N concurrent callers
//!   share one start attempt.
//! - [`ProcessRegistry`] supervises interactive child processes by
//!   logical id: stdin routing, bounded output buffering, and
//!   exit-driven cleanup with a grace period for trailing output.
//!
//! Both are plain objects; construct them once at the process boundary
//! and hand them to whatever needs them. Nothing here is a global.

pub mod buffer;
pub mod config;
pub mod error;
pub mod health;
pub mod process;
pub mod supervisor;

pub use buffer::OutputBuffer;
pub use config::SidecarConfig;
pub use error::{OrchestratorError, Result};
pub use process::{ProcessInfo, ProcessRegistry};
pub use supervisor::{ServiceDescriptor, ServiceStatus, ServiceSupervisor};
