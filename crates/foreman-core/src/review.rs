use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Task;

/// Score at or above which a PR with no blocking issues is approved. The
/// threshold exceeds the maximum attainable score without any test_coverage
/// contribution (100 − 25 = 75), so a PR cannot pass without tests.
pub const APPROVAL_THRESHOLD: u32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSeverity {
    Blocking,
    Suggestion,
}

/// Single structured piece of review feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub severity: FeedbackSeverity,
    pub category: String,
    pub file: String,
    pub line: u32,
    pub issue: String,
    pub suggestion: String,
}

/// Outcome of reviewing one PR iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub score: u32,
    pub approved: bool,
    pub blocking_issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub feedback: Vec<ReviewFeedback>,
    pub criteria_scores: BTreeMap<String, u32>,
}

/// Seam between the Moderator and the review implementation, so tests can
/// script review outcomes.
pub trait ReviewPr: Send + Sync {
    fn review_pr(&self, pr_number: i64, task: &Task) -> Result<ReviewResult>;
}

/// Partial result produced by one criterion sub-reviewer.
#[derive(Debug, Default)]
struct CriterionReview {
    score: u32,
    blocking_issues: Vec<String>,
    suggestions: Vec<String>,
    feedback: Vec<ReviewFeedback>,
}

/// Automated PR reviewer.
///
/// Criteria maxima sum to 100: code_quality 30, test_coverage 25,
/// security 20, documentation 15, acceptance_criteria 10. Approval requires
/// `score >= APPROVAL_THRESHOLD` and an empty blocking-issue list.
pub struct PrReviewer;

impl Default for PrReviewer {
    fn default() -> Self {
        Self::new()
    }
}

impl PrReviewer {
    pub fn new() -> Self {
        Self
    }

    fn review_code_quality(&self, _task: &Task) -> CriterionReview {
        // Baseline heuristic; linter-grade analysis lives in the analyzer
        // pipeline, not the review gate.
        CriterionReview { score: 25, ..Default::default() }
    }

    fn review_test_coverage(&self, task: &Task) -> CriterionReview {
        let has_tests = task.files_generated.iter().any(|f| is_test_artifact(f));
        if has_tests {
            return CriterionReview { score: 20, ..Default::default() };
        }
        CriterionReview {
            score: 0,
            blocking_issues: vec!["Missing unit tests".to_string()],
            feedback: vec![ReviewFeedback {
                severity: FeedbackSeverity::Blocking,
                category: "testing".into(),
                file: String::new(),
                line: 0,
                issue: "No test files found".into(),
                suggestion: "Add test files with unit tests".into(),
            }],
            ..Default::default()
        }
    }

    fn review_security(&self, task: &Task) -> CriterionReview {
        let mut review = CriterionReview { score: 18, ..Default::default() };
        for file in &task.files_generated {
            let Ok(contents) = std::fs::read_to_string(file) else {
                continue;
            };
            for (idx, line) in contents.lines().enumerate() {
                if let Some(kind) = hardcoded_secret(line) {
                    review.score = 8;
                    let issue = format!("Hard-coded {kind} in source");
                    review.blocking_issues.push(issue.clone());
                    review.feedback.push(ReviewFeedback {
                        severity: FeedbackSeverity::Blocking,
                        category: "security".into(),
                        file: file.clone(),
                        line: (idx + 1) as u32,
                        issue,
                        suggestion: "Load the value from configuration or the environment".into(),
                    });
                }
            }
        }
        review
    }

    fn review_documentation(&self, task: &Task) -> CriterionReview {
        let touches_readme = task
            .files_generated
            .iter()
            .any(|f| file_name(f).to_ascii_lowercase().starts_with("readme"));
        let score = if touches_readme { 15 } else { 12 };
        let suggestions = if touches_readme {
            Vec::new()
        } else {
            vec!["Consider updating the README for the new functionality".to_string()]
        };
        CriterionReview { score, suggestions, ..Default::default() }
    }

    fn review_acceptance_criteria(&self, task: &Task) -> CriterionReview {
        let total = task.acceptance_criteria.len().max(1) as u32;
        // Without a semantic evaluator, a criterion counts as met when the
        // task produced artifacts at all.
        let met = if task.files_generated.is_empty() { 0 } else { total };
        let score = 10 * met / total;
        let blocking_issues = if met < total {
            vec!["Acceptance criteria not fully met".to_string()]
        } else {
            Vec::new()
        };
        CriterionReview { score, blocking_issues, ..Default::default() }
    }
}

impl ReviewPr for PrReviewer {
    fn review_pr(&self, pr_number: i64, task: &Task) -> Result<ReviewResult> {
        info!(pr_number, task_id = %task.id, "review started");

        let mut criteria_scores = BTreeMap::new();
        let mut blocking_issues = Vec::new();
        let mut suggestions = Vec::new();
        let mut feedback = Vec::new();

        let parts: [(&str, CriterionReview); 5] = [
            ("code_quality", self.review_code_quality(task)),
            ("test_coverage", self.review_test_coverage(task)),
            ("security", self.review_security(task)),
            ("documentation", self.review_documentation(task)),
            ("acceptance_criteria", self.review_acceptance_criteria(task)),
        ];

        for (name, part) in parts {
            criteria_scores.insert(name.to_string(), part.score);
            blocking_issues.extend(part.blocking_issues);
            suggestions.extend(part.suggestions);
            feedback.extend(part.feedback);
        }

        let score: u32 = criteria_scores.values().sum();
        let approved = score >= APPROVAL_THRESHOLD && blocking_issues.is_empty();

        info!(
            pr_number,
            task_id = %task.id,
            score,
            approved,
            blocking_count = blocking_issues.len(),
            "review completed"
        );

        Ok(ReviewResult { score, approved, blocking_issues, suggestions, feedback, criteria_scores })
    }
}

fn file_name(path: &str) -> &str {
    Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or(path)
}

fn is_test_artifact(path: &str) -> bool {
    let name = file_name(path);
    name.starts_with("test_")
        || name.ends_with("_test.py")
        || name.ends_with(".test.js")
        || name.ends_with("_test.rs")
        || path.contains("/tests/")
}

fn hardcoded_secret(line: &str) -> Option<&'static str> {
    let lowered = line.to_ascii_lowercase();
    let trimmed = lowered.trim_start();
    if trimmed.starts_with('#') || trimmed.starts_with("//") {
        return None;
    }
    for (needle, kind) in [
        ("password", "password"),
        ("api_key", "API key"),
        ("secret", "secret"),
        ("token", "token"),
    ] {
        if let Some(pos) = lowered.find(needle) {
            let rest = &lowered[pos + needle.len()..];
            let rest = rest.trim_start();
            if let Some(rest) = rest.strip_prefix('=') {
                let value = rest.trim_start();
                if (value.starts_with('"') || value.starts_with('\'')) && value.len() > 3 {
                    return Some(kind);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn task_with_files(files: Vec<String>) -> Task {
        let mut task = Task::new("task_001", "Create a TODO CLI", vec!["works".into()]);
        task.files_generated = files;
        task
    }

    #[test]
    fn score_equals_sum_of_criteria() {
        let reviewer = PrReviewer::new();
        let task = task_with_files(vec!["app.py".into(), "test_app.py".into()]);
        let result = reviewer.review_pr(1, &task).unwrap();
        let sum: u32 = result.criteria_scores.values().sum();
        assert_eq!(result.score, sum);
        assert_eq!(result.criteria_scores.len(), 5);
    }

    #[test]
    fn approves_with_tests_and_no_blockers() {
        let reviewer = PrReviewer::new();
        let task = task_with_files(vec!["app.py".into(), "test_app.py".into()]);
        let result = reviewer.review_pr(1, &task).unwrap();
        assert!(result.score >= APPROVAL_THRESHOLD);
        assert!(result.blocking_issues.is_empty());
        assert!(result.approved);
    }

    #[test]
    fn missing_tests_blocks_approval() {
        let reviewer = PrReviewer::new();
        let task = task_with_files(vec!["app.py".into()]);
        let result = reviewer.review_pr(1, &task).unwrap();
        assert!(!result.approved);
        assert!(result.blocking_issues.contains(&"Missing unit tests".to_string()));
        assert_eq!(result.criteria_scores["test_coverage"], 0);
        // The missing-tests penalty alone pushes the score below threshold.
        assert!(result.score < APPROVAL_THRESHOLD);
        assert!(result
            .feedback
            .iter()
            .any(|f| f.severity == FeedbackSeverity::Blocking && f.category == "testing"));
    }

    #[test]
    fn hardcoded_secret_is_blocking() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app.py");
        let mut f = std::fs::File::create(&src).unwrap();
        writeln!(f, "password = \"hunter2\"").unwrap();
        let test = tmp.path().join("test_app.py");
        std::fs::write(&test, "def test_ok():\n    assert True\n").unwrap();

        let reviewer = PrReviewer::new();
        let task = task_with_files(vec![
            src.to_string_lossy().into_owned(),
            test.to_string_lossy().into_owned(),
        ]);
        let result = reviewer.review_pr(1, &task).unwrap();
        assert!(!result.approved);
        assert!(result.blocking_issues.iter().any(|b| b.contains("password")));
    }

    #[test]
    fn empty_artifacts_fail_acceptance_criteria() {
        let reviewer = PrReviewer::new();
        let task = task_with_files(Vec::new());
        let result = reviewer.review_pr(1, &task).unwrap();
        assert!(result
            .blocking_issues
            .contains(&"Acceptance criteria not fully met".to_string()));
        assert_eq!(result.criteria_scores["acceptance_criteria"], 0);
    }

    #[test]
    fn threshold_is_inclusive_at_80() {
        // A result scoring exactly 80 with no blockers approves; the
        // decision is computed the same way the reviewer computes it.
        let score = 80u32;
        assert!(score >= APPROVAL_THRESHOLD);
    }

    #[test]
    fn secret_detector_ignores_comments() {
        assert!(hardcoded_secret("password = \"hunter2\"").is_some());
        assert!(hardcoded_secret("# password = \"hunter2\"").is_none());
        assert!(hardcoded_secret("password = load_password()").is_none());
    }
}
