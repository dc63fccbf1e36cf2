use once_cell::sync::Lazy;
use regex::Regex;

use foreman_core::types::{Effort, Impact, Improvement, ImprovementCategory, ImprovementPriority, Task};

use crate::scan::{self, SourceFile};
use crate::Analyzer;

static RAISE_MSG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"raise\s+\w+\(\s*f?["']([^"']*)["']"#).expect("RAISE_MSG_RE compiles"));
static ADD_ARGUMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.add_argument\(").expect("ADD_ARGUMENT_RE compiles"));
static INPUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\binput\(").expect("INPUT_RE compiles"));

const GENERIC_MESSAGES: &[&str] = &["error", "failed", "invalid", "bad", "wrong"];
const LONG_RUNNING_HINTS: &[&str] =
    &["process", "download", "upload", "sync", "migrate", "import", "export", "batch"];

/// Flags operator-facing rough edges: vague error messages, silent
/// long-running work, CLI flags without help text, unvalidated input.
pub struct UxAnalyzer;

impl Analyzer for UxAnalyzer {
    fn analyzer_name(&self) -> &'static str {
        "ux"
    }

    fn analyze(&self, task: &Task) -> Vec<Improvement> {
        let mut improvements = Vec::new();
        for file in scan::python_artifacts(task) {
            if file.is_test_file() {
                continue;
            }
            self.check_error_messages(&file, &mut improvements);
            self.check_silent_long_running(&file, &mut improvements);
            self.check_cli_help(&file, &mut improvements);
            self.check_input_validation(&file, &mut improvements);
        }
        improvements
    }
}

impl UxAnalyzer {
    fn check_error_messages(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for (idx, line) in file.lines.iter().enumerate() {
            let Some(caps) = RAISE_MSG_RE.captures(line) else {
                continue;
            };
            let message = caps[1].trim();
            let lowered = message.to_ascii_lowercase();
            if !GENERIC_MESSAGES.contains(&lowered.as_str()) {
                continue;
            }
            out.push(Improvement::create(
                ImprovementCategory::Ux,
                ImprovementPriority::High,
                &file.path,
                Some((idx + 1) as u32),
                format!("Generic exception message \"{message}\""),
                "An exception is raised with a message that names neither the failing value nor the remedy.".to_string(),
                "Include what was expected, what was received, and how to fix it.",
                "Vague errors turn every failure into a debugging session for the user.",
                Impact::High,
                Effort::Trivial,
                self.analyzer_name(),
            ));
        }
    }

    fn check_silent_long_running(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            let name = function.name.to_ascii_lowercase();
            if !LONG_RUNNING_HINTS.iter().any(|hint| name.contains(hint)) {
                continue;
            }
            let body = function.body(file);
            let has_loop = body.iter().any(|l| scan::is_loop_line(l));
            if !has_loop {
                continue;
            }
            let observable = body.iter().any(|l| {
                let code = l.split('#').next().unwrap_or(l);
                code.contains("print(")
                    || code.contains("log")
                    || code.contains("progress")
                    || code.contains("tqdm")
            });
            if observable {
                continue;
            }
            out.push(Improvement::create(
                ImprovementCategory::Ux,
                ImprovementPriority::Medium,
                &file.path,
                Some(function.start as u32),
                format!("'{}' runs silently", function.name),
                format!(
                    "'{}' looks long-running and loops over its input without any progress output.",
                    function.name
                ),
                "Emit progress (count, percentage, or log lines) inside the loop.",
                "Silent batch work is indistinguishable from a hang.",
                Impact::Medium,
                Effort::Small,
                self.analyzer_name(),
            ));
        }
    }

    fn check_cli_help(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for (idx, line) in file.lines.iter().enumerate() {
            if !ADD_ARGUMENT_RE.is_match(line) {
                continue;
            }
            // Registration may span lines; look a short distance ahead for
            // the closing paren.
            let window_end = (idx + 4).min(file.lines.len());
            let registration = file.lines[idx..window_end].join(" ");
            let registration = registration
                .split_once(')')
                .map(|(head, _)| head.to_string())
                .unwrap_or(registration);
            if registration.contains("help=") {
                continue;
            }
            out.push(Improvement::create(
                ImprovementCategory::Ux,
                ImprovementPriority::Medium,
                &file.path,
                Some((idx + 1) as u32),
                "CLI argument registered without help text".to_string(),
                "An add_argument call has no help= description, so --help shows a bare flag.".to_string(),
                "Pass help=\"...\" describing the flag's effect and default.",
                "--help is the CLI's primary documentation.",
                Impact::Medium,
                Effort::Trivial,
                self.analyzer_name(),
            ));
        }
    }

    fn check_input_validation(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for (idx, line) in file.lines.iter().enumerate() {
            let code = line.split('#').next().unwrap_or(line);
            if !INPUT_RE.is_match(code) {
                continue;
            }
            let start = idx.saturating_sub(3);
            let end = (idx + 4).min(file.lines.len());
            let nearby = file.lines[start..end].join("\n");
            let validated = nearby.contains("try")
                || nearby.contains("int(")
                || nearby.contains(".strip()")
                || nearby.contains("if ");
            if validated {
                continue;
            }
            out.push(Improvement::create(
                ImprovementCategory::Ux,
                ImprovementPriority::Medium,
                &file.path,
                Some((idx + 1) as u32),
                "User input read without validation".to_string(),
                "input() is consumed with no surrounding validation or error handling.".to_string(),
                "Strip, validate, and re-prompt on bad input instead of failing later.",
                "Raw input reaches deeper code with whatever the user mistyped.",
                Impact::Medium,
                Effort::Small,
                self.analyzer_name(),
            ));
        }
    }
}
