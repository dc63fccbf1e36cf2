use foreman_core::types::{Effort, Impact, Improvement, ImprovementCategory, ImprovementPriority, Task};

use crate::scan::{self, contains_word, SourceFile};
use crate::Analyzer;

const CRITICAL_PATH_HINTS: &[&str] = &["api", "route", "service", "controller", "auth"];
const EDGE_HINT_TYPES: &[&str] = &["str", "int", "float", "list", "dict"];
const EDGE_MARKERS: &[&str] = &["None", "empty", "-1", "negative", "0"];

/// Flags coverage gaps: untested public functions, missing edge-case and
/// negative tests, and low-signal test bodies.
pub struct TestingAnalyzer;

impl Analyzer for TestingAnalyzer {
    fn analyzer_name(&self) -> &'static str {
        "testing"
    }

    fn analyze(&self, task: &Task) -> Vec<Improvement> {
        let files = scan::python_artifacts(task);
        let (tests, sources): (Vec<SourceFile>, Vec<SourceFile>) =
            files.into_iter().partition(|f| f.is_test_file());
        let test_corpus: String = tests
            .iter()
            .flat_map(|f| f.lines.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");

        let mut improvements = Vec::new();
        for file in &sources {
            self.check_coverage_gaps(file, &test_corpus, &mut improvements);
            self.check_edge_cases(file, &test_corpus, &mut improvements);
            self.check_error_paths(file, &test_corpus, &mut improvements);
        }
        for file in &tests {
            self.check_test_quality(file, &mut improvements);
        }
        improvements
    }
}

impl TestingAnalyzer {
    fn is_critical_path(path: &str) -> bool {
        let lowered = path.to_ascii_lowercase();
        CRITICAL_PATH_HINTS.iter().any(|hint| lowered.contains(hint))
    }

    fn check_coverage_gaps(&self, file: &SourceFile, test_corpus: &str, out: &mut Vec<Improvement>) {
        for function in file.module_functions() {
            if !function.is_public() {
                continue;
            }
            if contains_word(test_corpus, &function.name) {
                continue;
            }
            let (priority, impact) = if Self::is_critical_path(&file.path) {
                (ImprovementPriority::High, Impact::High)
            } else {
                (ImprovementPriority::Medium, Impact::Medium)
            };
            out.push(Improvement::create(
                ImprovementCategory::Testing,
                priority,
                &file.path,
                Some(function.start as u32),
                format!("Public function '{}' has no tests", function.name),
                format!("No test file references '{}'.", function.name),
                format!("Add unit tests exercising '{}' through its public contract.", function.name),
                "Untested public functions regress silently.",
                impact,
                Effort::Small,
                self.analyzer_name(),
            ));
        }
    }

    fn check_edge_cases(&self, file: &SourceFile, test_corpus: &str, out: &mut Vec<Improvement>) {
        for function in file.module_functions() {
            if !function.is_public() || !contains_word(test_corpus, &function.name) {
                continue;
            }
            let hinted: Vec<&str> = function
                .params
                .iter()
                .filter_map(|p| p.type_hint.as_deref())
                .filter(|hint| EDGE_HINT_TYPES.iter().any(|t| hint.starts_with(t)))
                .collect();
            if hinted.is_empty() {
                continue;
            }
            let covered = EDGE_MARKERS.iter().any(|marker| test_corpus.contains(marker));
            if covered {
                continue;
            }
            out.push(Improvement::create(
                ImprovementCategory::Testing,
                ImprovementPriority::Medium,
                &file.path,
                Some(function.start as u32),
                format!("Missing edge-case tests for '{}'", function.name),
                format!(
                    "'{}' takes {} parameter(s) with boundary-prone types but its tests exercise no edge values.",
                    function.name,
                    hinted.len()
                ),
                "Add cases for empty, zero, negative, and None-like inputs.",
                "Boundary inputs are where typed parameters break first.",
                Impact::Medium,
                Effort::Small,
                self.analyzer_name(),
            ));
        }
    }

    fn check_error_paths(&self, file: &SourceFile, test_corpus: &str, out: &mut Vec<Improvement>) {
        let has_negative_tests =
            test_corpus.contains("pytest.raises") || test_corpus.contains("assertRaises");
        for function in file.module_functions() {
            let raises = function
                .body(file)
                .iter()
                .any(|l| l.trim_start().starts_with("raise "));
            if !raises || has_negative_tests {
                continue;
            }
            let (priority, impact) = if function.is_public() {
                (ImprovementPriority::High, Impact::High)
            } else {
                (ImprovementPriority::Medium, Impact::Medium)
            };
            out.push(Improvement::create(
                ImprovementCategory::Testing,
                priority,
                &file.path,
                Some(function.start as u32),
                format!("No negative tests for '{}'", function.name),
                format!("'{}' raises exceptions but no test asserts on the failure path.", function.name),
                "Add tests asserting the raised exception type and message for invalid inputs.",
                "Unverified error paths fail in surprising ways under real misuse.",
                impact,
                Effort::Small,
                self.analyzer_name(),
            ));
        }
    }

    fn check_test_quality(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            if !function.name.starts_with("test_") {
                continue;
            }
            let body = function.body(file);
            let has_assertion = body.iter().any(|l| {
                let trimmed = l.trim_start();
                trimmed.starts_with("assert") || trimmed.contains(".assert_")
            });
            if !has_assertion {
                out.push(Improvement::create(
                    ImprovementCategory::Testing,
                    ImprovementPriority::Low,
                    &file.path,
                    Some(function.start as u32),
                    format!("Test '{}' has no assertions", function.name),
                    format!("'{}' executes code but never asserts an outcome.", function.name),
                    "Assert on the observable result, or delete the test.",
                    "Assertion-free tests pass no matter what the code does.",
                    Impact::Low,
                    Effort::Trivial,
                    self.analyzer_name(),
                ));
            }

            let mock_count = body
                .iter()
                .map(|l| l.matches("Mock(").count() + l.matches("patch(").count())
                .sum::<usize>();
            let verifies = body.iter().any(|l| l.contains("assert_called"));
            if mock_count >= 3 && !verifies {
                out.push(Improvement::create(
                    ImprovementCategory::Testing,
                    ImprovementPriority::Low,
                    &file.path,
                    Some(function.start as u32),
                    format!("Heavy mocking without verification in '{}'", function.name),
                    format!(
                        "'{}' sets up {mock_count} mocks but never verifies an interaction.",
                        function.name
                    ),
                    "Verify the calls the mocks exist to observe, or replace mocks with fakes.",
                    "Unverified mocks turn the test into a no-op harness.",
                    Impact::Low,
                    Effort::Small,
                    self.analyzer_name(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn task_with_files(sources: &[(&str, &str)]) -> (tempfile::TempDir, Task) {
        let tmp = tempfile::tempdir().unwrap();
        let mut task = Task::new("task_001", "demo", vec!["works".into()]);
        for (name, source) in sources {
            let path = tmp.path().join(name);
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(source.as_bytes()).unwrap();
            task.files_generated.push(path.to_string_lossy().into_owned());
        }
        (tmp, task)
    }

    #[test]
    fn untested_public_function_is_flagged() {
        let src = "def visible():\n    return 1\n\n\ndef _hidden():\n    return 2\n";
        let tests = "def test_nothing():\n    assert True\n";
        let (_tmp, task) = task_with_files(&[("app.py", src), ("test_app.py", tests)]);
        let found = TestingAnalyzer.analyze(&task);
        assert!(found.iter().any(|i| i.title.contains("'visible' has no tests")
            && i.priority == ImprovementPriority::Medium));
        assert!(!found.iter().any(|i| i.title.contains("_hidden")));
    }

    #[test]
    fn critical_path_gap_is_high_priority() {
        let src = "def login(user):\n    return user\n";
        let tests = "def test_other():\n    assert True\n";
        let (_tmp, task) = task_with_files(&[("auth_service.py", src), ("test_app.py", tests)]);
        let found = TestingAnalyzer.analyze(&task);
        let gap = found.iter().find(|i| i.title.contains("'login'")).unwrap();
        assert_eq!(gap.priority, ImprovementPriority::High);
        assert_eq!(gap.impact, Impact::High);
    }

    #[test]
    fn raising_function_without_negative_test() {
        let src = "def parse(raw):\n    if not raw:\n        raise ValueError(\"input must not be blank\")\n    return raw\n";
        let tests = "def test_parse():\n    assert parse(\"x\") == \"x\"\n";
        let (_tmp, task) = task_with_files(&[("app.py", src), ("test_app.py", tests)]);
        let found = TestingAnalyzer.analyze(&task);
        assert!(found.iter().any(|i| i.title.contains("No negative tests for 'parse'")));
    }

    #[test]
    fn negative_tests_suppress_error_path_finding() {
        let src = "def parse(raw):\n    if not raw:\n        raise ValueError(\"input must not be blank\")\n    return raw\n";
        let tests = "import pytest\n\n\ndef test_parse_rejects_blank():\n    with pytest.raises(ValueError):\n        parse(\"\")\n";
        let (_tmp, task) = task_with_files(&[("app.py", src), ("test_app.py", tests)]);
        let found = TestingAnalyzer.analyze(&task);
        assert!(!found.iter().any(|i| i.title.contains("No negative tests")));
    }

    #[test]
    fn assertion_free_test_is_flagged() {
        let tests = "def test_smoke():\n    run()\n\n\ndef test_real():\n    assert run() == 1\n";
        let (_tmp, task) = task_with_files(&[("test_app.py", tests)]);
        let found = TestingAnalyzer.analyze(&task);
        assert!(found.iter().any(|i| i.title.contains("'test_smoke' has no assertions")));
        assert!(!found.iter().any(|i| i.title.contains("'test_real'")));
    }

    #[test]
    fn heavy_unverified_mocking_is_flagged() {
        let tests = "def test_mocked():\n    a = Mock()\n    b = Mock()\n    c = Mock()\n    run(a, b, c)\n    assert True\n";
        let (_tmp, task) = task_with_files(&[("test_app.py", tests)]);
        let found = TestingAnalyzer.analyze(&task);
        assert!(found.iter().any(|i| i.title.contains("Heavy mocking")));
    }
}
