pub mod config;
pub mod metadata;
pub mod navigation;
pub mod orchestrator;
pub mod query_api;

pub use navigation::NavigationController;
pub use orchestrator::QueryOrchestrator;
