//! Improvement analyzers: stateless components that inspect a completed
//! task's generated artifacts and propose improvements.

use foreman_core::types::{Improvement, Task};

pub mod architecture;
pub mod docs;
pub mod engine;
pub mod performance;
pub mod pipeline;
pub mod quality;
pub mod scan;
pub mod testing;
pub mod ux;

pub use engine::ImprovementEngine;
pub use pipeline::AnalyzerPipeline;

/// One analysis perspective over a task's artifacts.
///
/// Implementations must be deterministic given identical artifacts, degrade
/// gracefully (log and skip) on unreadable files, and never execute anything
/// they inspect.
pub trait Analyzer: Send + Sync {
    /// Unique lowercase tag, used as `Improvement::analyzer_source`.
    fn analyzer_name(&self) -> &'static str;

    fn analyze(&self, task: &Task) -> Vec<Improvement>;
}
