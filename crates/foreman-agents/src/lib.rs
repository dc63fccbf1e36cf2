pub mod backend;
pub mod moderator;
pub mod monitor;
pub mod orchestrator;
pub mod techlead;

/// Well-known agent addresses on the bus.
pub const MODERATOR_ID: &str = "moderator";
pub const TECHLEAD_ID: &str = "techlead";
pub const MONITOR_ID: &str = "monitor";
