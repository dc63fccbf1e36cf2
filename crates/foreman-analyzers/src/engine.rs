use tracing::info;

use foreman_core::types::{
    Effort, Impact, Improvement, ImprovementCategory, ProjectState, TaskStatus,
};

use crate::AnalyzerPipeline;

/// Ranks the analyzer pipeline's output and surfaces the top candidates for
/// the Moderator's improvement cycle.
///
/// `priority_score = category_weight × impact_weight × 10 ÷ effort_weight`,
/// ties broken by (analyzer, file, line, title), so the ordering is stable
/// and reproducible across runs.
pub struct ImprovementEngine {
    pipeline: AnalyzerPipeline,
    max_improvements: usize,
}

fn category_weight(category: ImprovementCategory) -> f64 {
    match category {
        ImprovementCategory::Performance => 1.2,
        ImprovementCategory::Testing => 1.1,
        ImprovementCategory::CodeQuality => 1.0,
        ImprovementCategory::Architecture => 1.0,
        ImprovementCategory::Ux => 0.8,
        ImprovementCategory::Documentation => 0.7,
    }
}

fn impact_weight(impact: Impact) -> f64 {
    match impact {
        Impact::Critical => 4.0,
        Impact::High => 3.0,
        Impact::Medium => 2.0,
        Impact::Low => 1.0,
    }
}

fn effort_weight(effort: Effort) -> f64 {
    match effort {
        Effort::Trivial => 1.0,
        Effort::Small => 2.0,
        Effort::Medium => 3.0,
        Effort::Large => 5.0,
    }
}

pub fn priority_score(improvement: &Improvement) -> f64 {
    category_weight(improvement.category) * impact_weight(improvement.impact) * 10.0
        / effort_weight(improvement.effort)
}

impl Default for ImprovementEngine {
    fn default() -> Self {
        Self::new(AnalyzerPipeline::with_default_analyzers(), 1)
    }
}

impl ImprovementEngine {
    pub fn new(pipeline: AnalyzerPipeline, max_improvements: usize) -> Self {
        Self { pipeline, max_improvements }
    }

    pub fn analyzer_names(&self) -> Vec<&'static str> {
        self.pipeline.analyzer_names()
    }

    /// Analyze every completed task and return the top `max_improvements`
    /// candidates, scored and sorted.
    pub fn identify_improvements(&self, state: &ProjectState) -> Vec<Improvement> {
        let mut all = Vec::new();
        for task in state.tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
            all.extend(self.pipeline.run(task));
        }

        for improvement in &mut all {
            improvement.priority_score = priority_score(improvement);
        }

        all.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.analyzer_source.cmp(&b.analyzer_source))
                .then_with(|| a.target_file.cmp(&b.target_file))
                .then_with(|| a.target_line.cmp(&b.target_line))
                .then_with(|| a.title.cmp(&b.title))
        });
        all.truncate(self.max_improvements);

        info!(
            project_id = %state.project_id,
            count = all.len(),
            "improvements identified"
        );
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Analyzer;
    use foreman_core::types::{ImprovementPriority, Task};

    struct FixedAnalyzer(Vec<Improvement>);

    impl Analyzer for FixedAnalyzer {
        fn analyzer_name(&self) -> &'static str {
            "fixed"
        }

        fn analyze(&self, _task: &Task) -> Vec<Improvement> {
            self.0.clone()
        }
    }

    fn imp(title: &str, category: ImprovementCategory, impact: Impact, effort: Effort) -> Improvement {
        Improvement::create(
            category,
            ImprovementPriority::Medium,
            "app.py",
            Some(1),
            title,
            "d",
            "c",
            "r",
            impact,
            effort,
            "fixed",
        )
    }

    fn completed_state() -> ProjectState {
        let mut state = ProjectState::new("proj_1", "demo");
        let mut task = Task::new("task_001", "demo", vec!["works".into()]);
        task.status = TaskStatus::Completed;
        state.tasks.push(task);
        state
    }

    #[test]
    fn scoring_prefers_high_impact_low_effort() {
        let cheap_win = imp("cheap", ImprovementCategory::Performance, Impact::High, Effort::Trivial);
        let slog = imp("slog", ImprovementCategory::Performance, Impact::High, Effort::Large);
        assert!(priority_score(&cheap_win) > priority_score(&slog));

        // performance 1.2 × high 3.0 × 10 / trivial 1.0 = 36.
        assert!((priority_score(&cheap_win) - 36.0).abs() < 1e-9);
    }

    #[test]
    fn engine_returns_top_candidate_scored() {
        let engine = ImprovementEngine::new(
            AnalyzerPipeline::new(vec![Box::new(FixedAnalyzer(vec![
                imp("docs", ImprovementCategory::Documentation, Impact::Low, Effort::Large),
                imp("perf", ImprovementCategory::Performance, Impact::High, Effort::Small),
            ]))]),
            1,
        );
        let picked = engine.identify_improvements(&completed_state());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].title, "perf");
        assert!(picked[0].priority_score > 0.0);
    }

    #[test]
    fn pending_tasks_are_not_analyzed() {
        let engine = ImprovementEngine::new(
            AnalyzerPipeline::new(vec![Box::new(FixedAnalyzer(vec![imp(
                "perf",
                ImprovementCategory::Performance,
                Impact::High,
                Effort::Small,
            )]))]),
            5,
        );
        let mut state = completed_state();
        state.tasks[0].status = TaskStatus::Pending;
        assert!(engine.identify_improvements(&state).is_empty());
    }

    #[test]
    fn ordering_is_stable_across_runs() {
        let make_engine = || {
            ImprovementEngine::new(
                AnalyzerPipeline::new(vec![Box::new(FixedAnalyzer(vec![
                    imp("a", ImprovementCategory::CodeQuality, Impact::Medium, Effort::Small),
                    imp("b", ImprovementCategory::Architecture, Impact::Medium, Effort::Small),
                ]))]),
                2,
            )
        };
        let first: Vec<String> = make_engine()
            .identify_improvements(&completed_state())
            .into_iter()
            .map(|i| i.title)
            .collect();
        let second: Vec<String> = make_engine()
            .identify_improvements(&completed_state())
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(first, second);
    }
}
