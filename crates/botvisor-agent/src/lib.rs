//! Multi-tenant bot host: installs uploaded bundles, supervises one child
//! process per bot, enforces plan quotas and captures output.

pub mod config;
pub mod error;
pub mod host;
pub mod installer;
pub mod logs;
pub mod monitor;
pub mod plans;
pub mod proc_stats;
pub mod quota;
pub mod registry;
pub mod restart;
pub mod sandbox;
pub mod store;
pub mod supervisor;

pub use config::AgentConfig;
pub use error::{HostError, Result};
pub use host::Host;
pub use plans::{PlanBook, PlanProvider};
pub use registry::HostedBotRecord;
