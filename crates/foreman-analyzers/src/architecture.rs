use std::collections::{BTreeSet, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use foreman_core::types::{Effort, Impact, Improvement, ImprovementCategory, ImprovementPriority, Task};

use crate::scan::{self, module_stem, ClassBlock, SourceFile};
use crate::Analyzer;

const GOD_OBJECT_METHODS: usize = 10;
const SRP_CONCERN_FAMILIES: usize = 3;
const TIGHT_COUPLING_COLLABORATORS: usize = 3;
const TYPE_SWITCH_CHECKS: usize = 3;

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:from\s+\.?(\w+)\s+import|import\s+(\w+))").expect("IMPORT_RE compiles")
});
static CTOR_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"=\s*([A-Z]\w+)\(").expect("CTOR_CALL_RE compiles"));

/// Method-name prefix → concern family, for the SRP check.
const CONCERN_FAMILIES: &[(&str, &[&str])] = &[
    ("persistence", &["save", "load", "read", "write", "store", "fetch_db", "insert", "delete"]),
    ("network", &["send", "fetch", "request", "download", "upload", "post", "get_http"]),
    ("presentation", &["render", "format", "display", "print", "show", "draw"]),
    ("validation", &["validate", "check", "verify", "ensure", "assert_state"]),
    ("computation", &["calculate", "compute", "derive", "aggregate", "score"]),
    ("parsing", &["parse", "decode", "encode", "serialize", "deserialize"]),
];

/// Flags structural smells: SRP violations, type switching, god objects,
/// init-only data containers, circular imports, tight coupling.
pub struct ArchitectureAnalyzer;

impl Analyzer for ArchitectureAnalyzer {
    fn analyzer_name(&self) -> &'static str {
        "architecture"
    }

    fn analyze(&self, task: &Task) -> Vec<Improvement> {
        let files = scan::python_artifacts(task);
        let sources: Vec<&SourceFile> = files.iter().filter(|f| !f.is_test_file()).collect();

        let mut improvements = Vec::new();
        for file in &sources {
            for class in file.classes() {
                self.check_srp(file, &class, &mut improvements);
                self.check_god_object(file, &class, &mut improvements);
                self.check_data_container(file, &class, &mut improvements);
                self.check_tight_coupling(file, &class, &mut improvements);
            }
            self.check_type_switching(file, &mut improvements);
        }
        self.check_import_cycles(&sources, &mut improvements);
        improvements
    }
}

impl ArchitectureAnalyzer {
    fn concern_families(class: &ClassBlock) -> BTreeSet<&'static str> {
        let mut families = BTreeSet::new();
        for method in &class.methods {
            let name = method.name.to_ascii_lowercase();
            for (family, prefixes) in CONCERN_FAMILIES {
                if prefixes.iter().any(|p| name.starts_with(p)) {
                    families.insert(*family);
                }
            }
        }
        families
    }

    fn check_srp(&self, file: &SourceFile, class: &ClassBlock, out: &mut Vec<Improvement>) {
        let families = Self::concern_families(class);
        if families.len() < SRP_CONCERN_FAMILIES {
            return;
        }
        let list: Vec<&str> = families.into_iter().collect();
        out.push(Improvement::create(
            ImprovementCategory::Architecture,
            ImprovementPriority::Medium,
            &file.path,
            Some(class.start as u32),
            format!("'{}' mixes {} concerns", class.name, list.len()),
            format!("Method names in '{}' span distinct concern families: {}.", class.name, list.join(", ")),
            "Split the class so each resulting type owns one concern.",
            "A class with several reasons to change violates the single-responsibility principle.",
            Impact::Medium,
            Effort::Medium,
            self.analyzer_name(),
        ));
    }

    fn check_god_object(&self, file: &SourceFile, class: &ClassBlock, out: &mut Vec<Improvement>) {
        let public = class.methods.iter().filter(|m| m.is_public()).count();
        if public <= GOD_OBJECT_METHODS {
            return;
        }
        out.push(Improvement::create(
            ImprovementCategory::Architecture,
            ImprovementPriority::High,
            &file.path,
            Some(class.start as u32),
            format!("'{}' exposes {public} public methods", class.name),
            format!("'{}' has grown past {GOD_OBJECT_METHODS} public methods.", class.name),
            "Carve the surface into smaller collaborating types grouped by use.",
            "God objects attract every new feature and become unmodifiable.",
            Impact::Critical,
            Effort::Medium,
            self.analyzer_name(),
        ));
    }

    fn check_data_container(&self, file: &SourceFile, class: &ClassBlock, out: &mut Vec<Improvement>) {
        if class.methods.len() != 1 || class.methods[0].name != "__init__" {
            return;
        }
        out.push(Improvement::create(
            ImprovementCategory::Architecture,
            ImprovementPriority::Low,
            &file.path,
            Some(class.start as u32),
            format!("'{}' is an init-only data container", class.name),
            format!("'{}' defines only __init__ and carries data.", class.name),
            "Declare it as a dataclass (or NamedTuple) instead.",
            "Dataclasses state the intent and generate the boilerplate.",
            Impact::Low,
            Effort::Trivial,
            self.analyzer_name(),
        ));
    }

    fn check_tight_coupling(&self, file: &SourceFile, class: &ClassBlock, out: &mut Vec<Improvement>) {
        let Some(init) = class.methods.iter().find(|m| m.name == "__init__") else {
            return;
        };
        let mut collaborators = HashSet::new();
        for line in init.body(file) {
            let code = line.split('#').next().unwrap_or(line);
            for caps in CTOR_CALL_RE.captures_iter(code) {
                collaborators.insert(caps[1].to_string());
            }
        }
        if collaborators.len() <= TIGHT_COUPLING_COLLABORATORS {
            return;
        }
        out.push(Improvement::create(
            ImprovementCategory::Architecture,
            ImprovementPriority::Medium,
            &file.path,
            Some(init.start as u32),
            format!("'{}' constructs {} collaborators", class.name, collaborators.len()),
            format!(
                "'{}' instantiates its own dependencies ({}), hard-wiring the object graph.",
                class.name,
                collaborators.len()
            ),
            "Accept the collaborators as constructor parameters instead of building them inline.",
            "Direct construction prevents substitution in tests and alternative wiring.",
            Impact::Medium,
            Effort::Medium,
            self.analyzer_name(),
        ));
    }

    fn check_type_switching(&self, file: &SourceFile, out: &mut Vec<Improvement>) {
        for function in file.functions() {
            let checks = function
                .body(file)
                .iter()
                .map(|l| l.matches("isinstance(").count() + l.matches("type(").count())
                .sum::<usize>();
            if checks < TYPE_SWITCH_CHECKS {
                continue;
            }
            out.push(Improvement::create(
                ImprovementCategory::Architecture,
                ImprovementPriority::Medium,
                &file.path,
                Some(function.start as u32),
                format!("Type switching in '{}'", function.name),
                format!(
                    "'{}' branches on concrete types {checks} times instead of dispatching polymorphically.",
                    function.name
                ),
                "Move the per-type behavior onto the types themselves (method or visitor).",
                "Every new variant forces an edit here, violating the open/closed principle.",
                Impact::Medium,
                Effort::Medium,
                self.analyzer_name(),
            ));
        }
    }

    fn check_import_cycles(&self, files: &[&SourceFile], out: &mut Vec<Improvement>) {
        let modules: HashSet<String> = files.iter().map(|f| module_stem(&f.path).to_string()).collect();
        let mut graph: HashMap<String, BTreeSet<String>> = HashMap::new();
        for file in files {
            let stem = module_stem(&file.path).to_string();
            let edges = graph.entry(stem.clone()).or_default();
            for line in &file.lines {
                if let Some(caps) = IMPORT_RE.captures(line) {
                    let target = caps
                        .get(1)
                        .or_else(|| caps.get(2))
                        .map(|m| m.as_str().to_string());
                    if let Some(target) = target {
                        if modules.contains(&target) && target != stem {
                            edges.insert(target);
                        }
                    }
                }
            }
        }

        let mut reported: HashSet<(String, String)> = HashSet::new();
        for (module, edges) in &graph {
            for target in edges {
                let back = graph.get(target).map(|e| e.contains(module)).unwrap_or(false);
                if !back {
                    continue;
                }
                let pair = if module < target {
                    (module.clone(), target.clone())
                } else {
                    (target.clone(), module.clone())
                };
                if !reported.insert(pair) {
                    continue;
                }
                let path = files
                    .iter()
                    .find(|f| module_stem(&f.path) == module)
                    .map(|f| f.path.clone())
                    .unwrap_or_default();
                out.push(Improvement::create(
                    ImprovementCategory::Architecture,
                    ImprovementPriority::High,
                    path,
                    None,
                    format!("Circular import between '{module}' and '{target}'"),
                    format!("Modules '{module}' and '{target}' import each other."),
                    "Extract the shared pieces into a third module both can import.",
                    "Import cycles couple modules into one unit and break lazy loading.",
                    Impact::High,
                    Effort::Medium,
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
    fn mixed_concerns_violate_srp() {
        let src = "class Everything:\n    def save_record(self):\n        pass\n\n    def send_report(self):\n        pass\n\n    def render_page(self):\n        pass\n";
        let (_tmp, task) = task_with_files(&[("app.py", src)]);
        let found = ArchitectureAnalyzer.analyze(&task);
        assert!(found.iter().any(|i| i.title.contains("mixes 3 concerns")));
    }

    #[test]
    fn god_object_flagged_high() {
        let mut src = String::from("class Hub:\n");
        for i in 0..11 {
            src.push_str(&format!("    def op_{i}(self):\n        pass\n\n"));
        }
        let (_tmp, task) = task_with_files(&[("hub.py", &src)]);
        let found = ArchitectureAnalyzer.analyze(&task);
        let god = found.iter().find(|i| i.title.contains("public methods")).unwrap();
        assert_eq!(god.priority, ImprovementPriority::High);
        assert_eq!(god.impact, Impact::Critical);
    }

    #[test]
    fn init_only_class_suggests_dataclass() {
        let src = "class Point:\n    def __init__(self, x, y):\n        self.x = x\n        self.y = y\n";
        let (_tmp, task) = task_with_files(&[("geo.py", src)]);
        let found = ArchitectureAnalyzer.analyze(&task);
        let container = found.iter().find(|i| i.title.contains("data container")).unwrap();
        assert_eq!(container.priority, ImprovementPriority::Low);
    }

    #[test]
    fn constructor_building_four_collaborators_is_coupled() {
        let src = "class App:\n    def __init__(self):\n        self.db = Database()\n        self.cache = Cache()\n        self.mailer = Mailer()\n        self.clock = Clock()\n\n    def run(self):\n        pass\n";
        let (_tmp, task) = task_with_files(&[("app.py", src)]);
        let found = ArchitectureAnalyzer.analyze(&task);
        assert!(found.iter().any(|i| i.title.contains("constructs 4 collaborators")));
    }

    #[test]
    fn isinstance_ladder_is_type_switching() {
        let src = "def area(shape):\n    if isinstance(shape, Circle):\n        return 1\n    if isinstance(shape, Square):\n        return 2\n    if isinstance(shape, Triangle):\n        return 3\n    return 0\n";
        let (_tmp, task) = task_with_files(&[("shapes.py", src)]);
        let found = ArchitectureAnalyzer.analyze(&task);
        assert!(found.iter().any(|i| i.title.contains("Type switching in 'area'")));
    }

    #[test]
    fn circular_imports_reported_once_per_pair() {
        let a = "import b\n\n\ndef fa():\n    return b.fb()\n";
        let b = "import a\n\n\ndef fb():\n    return 1\n";
        let (_tmp, task) = task_with_files(&[("a.py", a), ("b.py", b)]);
        let found = ArchitectureAnalyzer.analyze(&task);
        let cycles: Vec<_> = found.iter().filter(|i| i.title.contains("Circular import")).collect();
        assert_eq!(cycles.len(), 1);
    }

    #[test]
    fn clean_small_class_passes() {
        let src = "class Greeter:\n    def greet(self, name):\n        return f\"hi {name}\"\n";
        let (_tmp, task) = task_with_files(&[("greet.py", src)]);
        assert!(ArchitectureAnalyzer.analyze(&task).is_empty());
    }
}
