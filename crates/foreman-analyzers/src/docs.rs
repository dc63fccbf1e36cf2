use foreman_core::types::{Effort, Impact, Improvement, ImprovementCategory, ImprovementPriority, Task};

use crate::scan::{self, contains_word, file_name, FunctionBlock, SourceFile};
use crate::Analyzer;

const COMPLEX_FUNCTION_LINES: usize = 20;
const COMPLEX_FUNCTION_PARAMS: usize = 3;

/// Flags documentation gaps: missing module/class/function docstrings,
/// undocumented parameters and return values, and README drift when a task
/// introduces new public API.
pub struct DocumentationAnalyzer;

impl Analyzer for DocumentationAnalyzer {
    fn analyzer_name(&self) -> &'static str {
        "documentation"
    }

    fn analyze(&self, task: &Task) -> Vec<Improvement> {
        let files = scan::python_artifacts(task);
        let sources: Vec<&SourceFile> = files.iter().filter(|f| !f.is_test_file()).collect();

        let mut improvements = Vec::new();
        for file in &sources {
            self.check_docstring_presence(file, &mut improvements);
            self.check_parameter_docs(file, &mut improvements);
            self.check_return_docs(file, &mut improvements);
        }
        self.check_readme(task, &sources, &mut improvements);
        improvements
    }
}

impl DocumentationAnalyzer {
    fn is_complex(function: &FunctionBlock) -> bool {
        function.line_count() > COMPLEX_FUNCTION_LINES
            || function.params.len() > COMPLEX_FUNCTION_PARAMS
    }

    fn check_docstring_presence(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        if !file.has_module_docstring() {
            out.push(Improvement::create(
                ImprovementCategory::Documentation,
                ImprovementPriority::Medium,
                &file.path,
                Some(1),
                "Missing module docstring".to_string(),
                format!("{} has no module-level docstring.", file_name(&file.path)),
                "Open the file with a short docstring stating what the module provides.",
                "A module docstring is the first thing a reader and the doc tooling see.",
                Impact::Medium,
                Effort::Trivial,
                self.analyzer_name(),
            ));
        }

        for class in file.classes() {
            if class.has_docstring {
                continue;
            }
            out.push(Improvement::create(
                ImprovementCategory::Documentation,
                ImprovementPriority::High,
                &file.path,
                Some(class.start as u32),
                format!("Class '{}' has no docstring", class.name),
                format!("'{}' exposes {} method(s) without a class docstring.", class.name, class.methods.len()),
                "Document the class's responsibility and typical usage.",
                "Classes are entry points; undocumented ones force readers into the implementation.",
                Impact::High,
                Effort::Trivial,
                self.analyzer_name(),
            ));
        }

        for function in file.functions() {
            if function.has_docstring || !function.is_public() || function.name == "__init__" {
                continue;
            }
            let (priority, impact) = if Self::is_complex(&function) {
                (ImprovementPriority::High, Impact::High)
            } else {
                (ImprovementPriority::Medium, Impact::Medium)
            };
            out.push(Improvement::create(
                ImprovementCategory::Documentation,
                priority,
                &file.path,
                Some(function.start as u32),
                format!("Function '{}' has no docstring", function.name),
                format!("Public function '{}' is undocumented.", function.name),
                "Add a docstring covering purpose, parameters, and return value.",
                "Undocumented public functions push every caller into reading the body.",
                impact,
                Effort::Trivial,
                self.analyzer_name(),
            ));
        }
    }

    fn check_parameter_docs(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            let Some(docstring) = function.docstring(file) else {
                continue;
            };
            if function.params.is_empty() {
                continue;
            }
            // Only meaningful when the docstring attempts a parameter section.
            if !docstring.contains("Args:") && !docstring.contains("Parameters") {
                continue;
            }
            let missing: Vec<&str> = function
                .params
                .iter()
                .map(|p| p.name.as_str())
                .filter(|name| !contains_word(&docstring, name))
                .collect();
            if missing.is_empty() {
                continue;
            }
            out.push(Improvement::create(
                ImprovementCategory::Documentation,
                ImprovementPriority::Medium,
                &file.path,
                Some(function.start as u32),
                format!("Undocumented parameter(s) in '{}'", function.name),
                format!(
                    "'{}' documents its arguments but omits: {}.",
                    function.name,
                    missing.join(", ")
                ),
                "List every parameter in the Args section.",
                "Half-documented signatures are worse than none; callers trust the listed set.",
                Impact::Medium,
                Effort::Trivial,
                self.analyzer_name(),
            ));
        }
    }

    fn check_return_docs(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            let Some(docstring) = function.docstring(file) else {
                continue;
            };
            let returns_value = function.body(file).iter().any(|l| {
                let trimmed = l.trim_start();
                trimmed.starts_with("return ") && !trimmed.starts_with("return None")
            });
            if !returns_value || docstring.contains("Returns") || docstring.contains("return") {
                continue;
            }
            out.push(Improvement::create(
                ImprovementCategory::Documentation,
                ImprovementPriority::Medium,
                &file.path,
                Some(function.start as u32),
                format!("Missing return description in '{}'", function.name),
                format!("'{}' returns a value its docstring never mentions.", function.name),
                "Add a Returns section describing the value and its type.",
                "Callers need the return contract without reading the body.",
                Impact::Medium,
                Effort::Trivial,
                self.analyzer_name(),
            ));
        }
    }

    fn check_readme(&self, task: &Task, sources: &[&SourceFile], out: &mut Vec<Improvement>) {
        let introduces_api = sources
            .iter()
            .any(|f| f.module_functions().iter().any(FunctionBlock::is_public));
        if !introduces_api {
            return;
        }
        let has_readme = task
            .files_generated
            .iter()
            .any(|p| file_name(p).to_ascii_lowercase().starts_with("readme"));
        if has_readme {
            return;
        }
        let target = sources.first().map(|f| f.path.clone()).unwrap_or_default();
        out.push(Improvement::create(
            ImprovementCategory::Documentation,
            ImprovementPriority::Medium,
            target,
            None,
            "README not updated for new public API".to_string(),
            "The task introduces public functions but produced no README change.".to_string(),
            "Describe the new surface and a usage example in the README.",
            "The README is the only documentation most users read.",
            Impact::Medium,
            Effort::Small,
            self.analyzer_name(),
        ));
    }
}
