use std::collections::HashSet;

use tracing::info;

use foreman_core::types::{Improvement, Task};

use crate::architecture::ArchitectureAnalyzer;
use crate::docs::DocumentationAnalyzer;
use crate::performance::PerformanceAnalyzer;
use crate::quality::CodeQualityAnalyzer;
use crate::testing::TestingAnalyzer;
use crate::ux::UxAnalyzer;
use crate::Analyzer;

/// Runs the enabled analyzers over a task's artifacts and returns a
/// deduplicated, priority-sorted union of their improvements.
pub struct AnalyzerPipeline {
    analyzers: Vec<Box<dyn Analyzer>>,
}

impl Default for AnalyzerPipeline {
    fn default() -> Self {
        Self::with_default_analyzers()
    }
}

impl AnalyzerPipeline {
    pub fn new(analyzers: Vec<Box<dyn Analyzer>>) -> Self {
        Self { analyzers }
    }

    pub fn with_default_analyzers() -> Self {
        Self::new(vec![
            Box::new(PerformanceAnalyzer),
            Box::new(CodeQualityAnalyzer),
            Box::new(TestingAnalyzer),
            Box::new(DocumentationAnalyzer),
            Box::new(UxAnalyzer),
            Box::new(ArchitectureAnalyzer),
        ])
    }

    pub fn analyzer_names(&self) -> Vec<&'static str> {
        self.analyzers.iter().map(|a| a.analyzer_name()).collect()
    }

    /// Flatten every analyzer's findings, dedup by
    /// (analyzer_source, target_file, target_line, title), and sort by
    /// priority then analyzer name.
    pub fn run(&self, task: &Task) -> Vec<Improvement> {
        let mut all = Vec::new();
        for analyzer in &self.analyzers {
            let found = analyzer.analyze(task);
            info!(
                analyzer = analyzer.analyzer_name(),
                task_id = %task.id,
                count = found.len(),
                "analyzer finished"
            );
            all.extend(found);
        }

        let mut seen: HashSet<(String, String, Option<u32>, String)> = HashSet::new();
        all.retain(|imp| {
            seen.insert((
                imp.analyzer_source.clone(),
                imp.target_file.clone(),
                imp.target_line,
                imp.title.clone(),
            ))
        });

        all.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.analyzer_source.cmp(&b.analyzer_source))
        });
        all
    }
}
