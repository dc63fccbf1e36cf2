use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use foreman_core::types::{Effort, Impact, Improvement, ImprovementCategory, ImprovementPriority, Task};

use crate::scan::{self, SourceFile};
use crate::Analyzer;

static CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([a-z_][a-z0-9_]*)\(([^()]*)\)").expect("CALL_RE compiles"));
static STR_CONCAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\w+\s*\+=\s*["']|\w+\s*\+=\s*f["']|\+\s*str\("#).expect("STR_CONCAT_RE compiles"));

const DB_CALL_HINTS: &[&str] = &["query", "execute", "fetch", "find_one", "select", "get_object"];

/// Flags algorithmic hot spots: nested loops, repeated pure calls, string
/// building in loops, per-iteration database access, list growth patterns.
pub struct PerformanceAnalyzer;

impl Analyzer for PerformanceAnalyzer {
    fn analyzer_name(&self) -> &'static str {
        "performance"
    }

    fn analyze(&self, task: &Task) -> Vec<Improvement> {
        let mut improvements = Vec::new();
        for file in scan::python_artifacts(task) {
            if file.is_test_file() {
                continue;
            }
            self.detect_nested_loops(&file, &mut improvements);
            self.detect_repeated_calls(&file, &mut improvements);
            self.detect_loop_inefficiencies(&file, &mut improvements);
        }
        improvements
    }
}

impl PerformanceAnalyzer {
    fn detect_nested_loops(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            let body = function.body(file);
            let (depth, line_idx) = scan::max_loop_nesting(body);
            if depth < 2 {
                continue;
            }
            let (priority, impact) = if depth >= 3 {
                (ImprovementPriority::High, Impact::High)
            } else {
                (ImprovementPriority::Medium, Impact::Medium)
            };
            out.push(Improvement::create(
                ImprovementCategory::Performance,
                priority,
                &file.path,
                Some((function.start + line_idx + 1) as u32),
                format!("Nested loops (depth {depth}) in '{}'", function.name),
                format!(
                    "'{}' contains loops nested {depth} deep, giving at least O(n^{depth}) behavior over its inputs.",
                    function.name
                ),
                "Restructure with a lookup table, set membership, or a single pass that accumulates intermediate results.",
                "Nested iteration dominates runtime as input size grows.",
                impact,
                Effort::Medium,
                self.analyzer_name(),
            ));
        }
    }

    fn detect_repeated_calls(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
            for (idx, line) in function.body(file).iter().enumerate() {
                let code = line.split('#').next().unwrap_or(line);
                for caps in CALL_RE.captures_iter(code) {
                    let callee = &caps[1];
                    if KEYWORD_CALLS.contains(&callee) {
                        continue;
                    }
                    let signature = format!("{}({})", callee, caps[2].trim());
                    let entry = counts.entry(signature).or_insert((0, idx));
                    entry.0 += 1;
                }
            }
            for (signature, (count, first_idx)) in counts {
                if count < 3 {
                    continue;
                }
                out.push(Improvement::create(
                    ImprovementCategory::Performance,
                    ImprovementPriority::Medium,
                    &file.path,
                    Some((function.start + first_idx + 1) as u32),
                    format!("Repeated call '{signature}' in '{}'", function.name),
                    format!(
                        "'{signature}' is invoked {count} times with identical arguments inside '{}'.",
                        function.name
                    ),
                    "Compute the value once and reuse it, or memoize the callee if it is pure.",
                    "Identical calls repeated in one function usually recompute the same result.",
                    Impact::Medium,
                    Effort::Small,
                    self.analyzer_name(),
                ));
            }
        }
    }

    fn detect_loop_inefficiencies(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            let body = function.body(file);
            let inside = scan::lines_inside_loops(body);
            let mut reported_concat = false;
            let mut reported_db = false;
            let mut reported_append = false;
            for idx in inside {
                let line = &body[idx];
                let code = line.split('#').next().unwrap_or(line);
                let line_no = Some((function.start + idx + 1) as u32);

                if !reported_concat && STR_CONCAT_RE.is_match(code) {
                    reported_concat = true;
                    out.push(Improvement::create(
                        ImprovementCategory::Performance,
                        ImprovementPriority::Medium,
                        &file.path,
                        line_no,
                        format!("String concatenation in loop in '{}'", function.name),
                        "A string is built up with += inside a loop, copying the accumulator on every iteration.".to_string(),
                        "Collect the pieces in a list and join once after the loop.",
                        "Repeated string concatenation is quadratic in the result length.",
                        Impact::Medium,
                        Effort::Small,
                        self.analyzer_name(),
                    ));
                }

                if !reported_db && DB_CALL_HINTS.iter().any(|hint| code.contains(&format!("{hint}("))) {
                    reported_db = true;
                    out.push(Improvement::create(
                        ImprovementCategory::Performance,
                        ImprovementPriority::High,
                        &file.path,
                        line_no,
                        format!("Database access inside loop in '{}'", function.name),
                        "A query-like call executes once per loop iteration (N+1 pattern).".to_string(),
                        "Batch the lookups into a single query before the loop and index the results.",
                        "Per-iteration queries multiply round trips with collection size.",
                        Impact::High,
                        Effort::Medium,
                        self.analyzer_name(),
                    ));
                }

                if !reported_append && code.contains(".append(") {
                    reported_append = true;
                    out.push(Improvement::create(
                        ImprovementCategory::Performance,
                        ImprovementPriority::Low,
                        &file.path,
                        line_no,
                        format!("List built by append in loop in '{}'", function.name),
                        "A list is grown element-by-element inside a loop.".to_string(),
                        "Use a list comprehension or generator expression where the loop only transforms elements.",
                        "Comprehensions are clearer and avoid repeated method dispatch.",
                        Impact::Low,
                        Effort::Trivial,
                        self.analyzer_name(),
                    ));
                }
            }
        }
    }
}

const KEYWORD_CALLS: &[&str] = &["print", "len", "range", "enumerate", "isinstance", "str", "int", "float", "list", "dict", "set"];
