pub mod analyze;
pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod record;
pub mod report;
pub mod runtime;
pub mod screenshot;
pub mod similarity;
pub mod sitemap;
pub mod store;
pub mod types;

pub use runtime::{Orchestrator, run};
