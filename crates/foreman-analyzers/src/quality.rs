use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use foreman_core::types::{Effort, Impact, Improvement, ImprovementCategory, ImprovementPriority, Task};

use crate::scan::{self, contains_word, SourceFile};
use crate::Analyzer;

const COMPLEXITY_MEDIUM: usize = 10;
const COMPLEXITY_HIGH: usize = 15;
const LONG_FUNCTION_LINES: usize = 50;
const DUPLICATE_BLOCK_LINES: usize = 6;
const DUPLICATE_BLOCK_LARGE: usize = 10;

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^import\s+(\w+)|^from\s+[\w.]+\s+import\s+(.+)$").expect("IMPORT_RE compiles"));
static ASSIGN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)([a-z_][a-z0-9_]*)\s*=[^=]").expect("ASSIGN_RE compiles"));

const BRANCH_KEYWORDS: &[&str] = &["if ", "elif ", "for ", "while ", "except", "case ", " and ", " or "];

/// Flags structural debt: cyclomatic complexity, duplicated blocks, long
/// functions, unused imports and locals.
pub struct CodeQualityAnalyzer;

impl Analyzer for CodeQualityAnalyzer {
    fn analyzer_name(&self) -> &'static str {
        "code_quality"
    }

    fn analyze(&self, task: &Task) -> Vec<Improvement> {
        let files = scan::python_artifacts(task);
        let sources: Vec<&SourceFile> = files.iter().filter(|f| !f.is_test_file()).collect();

        let mut improvements = Vec::new();
        for file in &sources {
            self.check_complexity(file, &mut improvements);
            self.check_long_functions(file, &mut improvements);
            self.check_unused_imports(file, &mut improvements);
            self.check_unused_locals(file, &mut improvements);
        }
        self.check_duplication(&sources, &mut improvements);
        improvements
    }
}

impl CodeQualityAnalyzer {
    /// Branch-keyword count plus one, a line-level stand-in for cyclomatic
    /// complexity.
    fn complexity_of(body: &[String]) -> usize {
        let mut complexity = 1;
        for line in body {
            let code = line.split('#').next().unwrap_or(line);
            let trimmed = code.trim_start();
            for keyword in BRANCH_KEYWORDS {
                if keyword.ends_with(' ') && !keyword.starts_with(' ') {
                    if trimmed.starts_with(keyword) {
                        complexity += 1;
                    }
                } else if code.contains(keyword) {
                    complexity += 1;
                }
            }
        }
        complexity
    }

    fn check_complexity(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            let complexity = Self::complexity_of(function.body(file));
            if complexity <= COMPLEXITY_MEDIUM {
                continue;
            }
            let (priority, impact, effort) = if complexity > COMPLEXITY_HIGH {
                (ImprovementPriority::High, Impact::High, Effort::Medium)
            } else {
                (ImprovementPriority::Medium, Impact::Medium, Effort::Small)
            };
            out.push(Improvement::create(
                ImprovementCategory::CodeQuality,
                priority,
                &file.path,
                Some(function.start as u32),
                format!("High cyclomatic complexity ({complexity}) in '{}'", function.name),
                format!(
                    "'{}' has an estimated cyclomatic complexity of {complexity}, above the target of {COMPLEXITY_MEDIUM}.",
                    function.name
                ),
                "Extract cohesive branches into named helper functions.",
                "Complex functions resist review and accumulate defects.",
                impact,
                effort,
                self.analyzer_name(),
            ));
        }
    }

    fn check_long_functions(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            let length = function.line_count();
            if length <= LONG_FUNCTION_LINES {
                continue;
            }
            out.push(Improvement::create(
                ImprovementCategory::CodeQuality,
                ImprovementPriority::Medium,
                &file.path,
                Some(function.start as u32),
                format!("Function '{}' is {length} lines long", function.name),
                format!("'{}' spans {length} lines, above the {LONG_FUNCTION_LINES}-line target.", function.name),
                "Split the function along its phases into smaller named steps.",
                "Long functions mix concerns and hide their control flow.",
                Impact::Medium,
                Effort::Medium,
                self.analyzer_name(),
            ));
        }
    }

    fn check_duplication(&self, files: &[&SourceFile], out: &mut Vec<Improvement>) {
        // Normalized sliding windows across the artifact set; first
        // occurrence wins, later ones are reported against it.
        let mut seen: HashMap<Vec<String>, (String, usize)> = HashMap::new();
        let mut reported: HashMap<Vec<String>, usize> = HashMap::new();

        for file in files {
            let normalized: Vec<String> = file.lines.iter().map(|l| l.trim().to_string()).collect();
            if normalized.len() < DUPLICATE_BLOCK_LINES {
                continue;
            }
            let mut idx = 0;
            while idx + DUPLICATE_BLOCK_LINES <= normalized.len() {
                let window = &normalized[idx..idx + DUPLICATE_BLOCK_LINES];
                if window.iter().all(|l| !l.is_empty()) {
                    let key: Vec<String> = window.to_vec();
                    match seen.get(&key).cloned() {
                        Some((first_path, first_line))
                            if !(first_path == file.path && first_line == idx) =>
                        {
                            if !reported.contains_key(&key) {
                                // Grow the match to gauge block size.
                                let mut size = DUPLICATE_BLOCK_LINES;
                                while idx + size < normalized.len()
                                    && !normalized[idx + size].is_empty()
                                {
                                    size += 1;
                                    if size > 40 {
                                        break;
                                    }
                                }
                                let (priority, impact) = if size >= DUPLICATE_BLOCK_LARGE {
                                    (ImprovementPriority::High, Impact::High)
                                } else {
                                    (ImprovementPriority::Medium, Impact::Medium)
                                };
                                reported.insert(key.clone(), size);
                                out.push(Improvement::create(
                                    ImprovementCategory::CodeQuality,
                                    priority,
                                    &file.path,
                                    Some((idx + 1) as u32),
                                    format!("Duplicated block of {DUPLICATE_BLOCK_LINES}+ lines"),
                                    format!(
                                        "Lines here repeat a block that first appears in {}:{}.",
                                        first_path,
                                        first_line + 1
                                    ),
                                    "Extract the shared block into a common helper and call it from both sites.",
                                    "Duplicated logic drifts apart as only one copy gets fixed.",
                                    impact,
                                    Effort::Small,
                                    self.analyzer_name(),
                                ));
                                idx += DUPLICATE_BLOCK_LINES;
                                continue;
                            }
                        }
                        Some(_) => {}
                        None => {
                            seen.insert(key, (file.path.clone(), idx));
                        }
                    }
                }
                idx += 1;
            }
        }
    }

    fn check_unused_imports(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for (idx, line) in file.lines.iter().enumerate() {
            let Some(caps) = IMPORT_RE.captures(line) else {
                continue;
            };
            let names: Vec<String> = if let Some(module) = caps.get(1) {
                vec![module.as_str().to_string()]
            } else {
                caps.get(2)
                    .map(|m| {
                        m.as_str()
                            .split(',')
                            .map(|n| {
                                // "x as y" binds y.
                                let n = n.trim();
                                n.rsplit(" as ").next().unwrap_or(n).trim().to_string()
                            })
                            .filter(|n| n != "*")
                            .collect()
                    })
                    .unwrap_or_default()
            };

            for name in names {
                let used = file
                    .lines
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != idx)
                    .any(|(_, l)| {
                        let code = l.split('#').next().unwrap_or(l);
                        contains_word(code, &name)
                    });
                if !used {
                    out.push(Improvement::create(
                        ImprovementCategory::CodeQuality,
                        ImprovementPriority::Low,
                        &file.path,
                        Some((idx + 1) as u32),
                        format!("Unused import '{name}'"),
                        format!("'{name}' is imported but never referenced in this module."),
                        "Delete the import.",
                        "Dead imports obscure the module's real dependencies.",
                        Impact::Low,
                        Effort::Trivial,
                        self.analyzer_name(),
                    ));
                }
            }
        }
    }

    fn check_unused_locals(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            let body = function.body(file);
            for (idx, line) in body.iter().enumerate() {
                let Some(caps) = ASSIGN_RE.captures(line) else {
                    continue;
                };
                let name = caps[2].to_string();
                if name.starts_with('_') || name == "self" {
                    continue;
                }
                let used_later = body
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != idx)
                    .any(|(_, l)| {
                        let code = l.split('#').next().unwrap_or(l);
                        contains_word(code, &name)
                    });
                if !used_later {
                    out.push(Improvement::create(
                        ImprovementCategory::CodeQuality,
                        ImprovementPriority::Low,
                        &file.path,
                        Some((function.start + idx + 1) as u32),
                        format!("Unused local '{name}' in '{}'", function.name),
                        format!("'{name}' is assigned but never read within '{}'.", function.name),
                        "Remove the assignment, or prefix with an underscore if the call is kept for effect.",
                        "Unused bindings suggest leftover or incomplete logic.",
                        Impact::Low,
                        Effort::Trivial,
                        self.analyzer_name(),
                    ));
                }
            }
        }
    }
}
