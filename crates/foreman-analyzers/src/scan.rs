//! Shared line-oriented scanning over generated Python artifacts.
//!
//! The analyzers work on source text, not a real AST: block extents are
//! recovered from indentation, which is enough for the heuristics here and
//! degrades gracefully on files a parser would reject.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use foreman_core::types::Task;

static DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\s*)def\s+(\w+)\s*\((.*)\)\s*(?:->\s*[^:]+)?:").expect("DEF_RE compiles")
});
static CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)class\s+(\w+)").expect("CLASS_RE compiles"));

/// One function parameter, as written.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub type_hint: Option<String>,
    pub has_default: bool,
}

/// A `def` block recovered by indentation.
#[derive(Debug, Clone)]
pub struct FunctionBlock {
    pub name: String,
    pub params: Vec<Param>,
    /// 1-based line number of the `def` line.
    pub start: usize,
    /// 1-based line number of the last body line (inclusive).
    pub end: usize,
    pub indent: usize,
    pub has_docstring: bool,
}

impl FunctionBlock {
    pub fn is_public(&self) -> bool {
        !self.name.starts_with('_')
    }

    pub fn line_count(&self) -> usize {
        self.end.saturating_sub(self.start) + 1
    }

    /// Body lines (everything after the `def` line).
    pub fn body<'a>(&self, file: &'a SourceFile) -> &'a [String] {
        &file.lines[self.start..self.end]
    }

    /// The docstring text, when present, joined into one string.
    pub fn docstring(&self, file: &SourceFile) -> Option<String> {
        if !self.has_docstring {
            return None;
        }
        let mut collected = Vec::new();
        let mut open = false;
        for line in self.body(file) {
            let trimmed = line.trim();
            if !open {
                if trimmed.is_empty() {
                    continue;
                }
                open = true;
                collected.push(trimmed.to_string());
                // One-line docstring: """text"""
                if trimmed.len() > 3 && ends_docstring(trimmed) {
                    return Some(collected.join("\n"));
                }
            } else {
                collected.push(trimmed.to_string());
                if ends_docstring(trimmed) {
                    return Some(collected.join("\n"));
                }
            }
        }
        Some(collected.join("\n"))
    }
}

fn ends_docstring(trimmed: &str) -> bool {
    trimmed.ends_with("\"\"\"") || trimmed.ends_with("'''")
}

/// A `class` block recovered by indentation.
#[derive(Debug, Clone)]
pub struct ClassBlock {
    pub name: String,
    pub start: usize,
    pub end: usize,
    pub indent: usize,
    pub methods: Vec<FunctionBlock>,
    pub has_docstring: bool,
}

impl ClassBlock {
    pub fn public_methods(&self) -> impl Iterator<Item = &FunctionBlock> {
        self.methods.iter().filter(|m| m.is_public() || m.name == "__init__")
    }
}

/// A loaded artifact split into lines.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: String,
    pub lines: Vec<String>,
}

impl SourceFile {
    pub fn parse(path: impl Into<String>, contents: &str) -> Self {
        Self {
            path: path.into(),
            lines: contents.lines().map(str::to_string).collect(),
        }
    }

    pub fn load(path: &str) -> Option<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Some(Self::parse(path, &contents)),
            Err(e) => {
                warn!(path, "skipping unreadable artifact: {e}");
                None
            }
        }
    }

    pub fn is_test_file(&self) -> bool {
        let name = file_name(&self.path);
        name.starts_with("test_") || name.ends_with("_test.py") || self.path.contains("/tests/")
    }

    /// True when the file opens with a module docstring.
    pub fn has_module_docstring(&self) -> bool {
        for line in &self.lines {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return trimmed.starts_with("\"\"\"") || trimmed.starts_with("'''");
        }
        false
    }

    /// All `def` blocks, including methods.
    pub fn functions(&self) -> Vec<FunctionBlock> {
        let mut functions = Vec::new();
        for (idx, line) in self.lines.iter().enumerate() {
            if let Some(caps) = DEF_RE.captures(line) {
                let indent = caps[1].len();
                let name = caps[2].to_string();
                let params = parse_params(&caps[3]);
                let end = self.block_end(idx, indent);
                let has_docstring = self
                    .lines
                    .get(idx + 1..end)
                    .map(|body| {
                        body.iter()
                            .map(|l| l.trim())
                            .find(|l| !l.is_empty())
                            .is_some_and(|l| l.starts_with("\"\"\"") || l.starts_with("'''"))
                    })
                    .unwrap_or(false);
                functions.push(FunctionBlock {
                    name,
                    params,
                    start: idx + 1,
                    end,
                    indent,
                    has_docstring,
                });
            }
        }
        functions
    }

    /// Top-level (module) functions only.
    pub fn module_functions(&self) -> Vec<FunctionBlock> {
        self.functions().into_iter().filter(|f| f.indent == 0).collect()
    }

    pub fn classes(&self) -> Vec<ClassBlock> {
        let functions = self.functions();
        let mut classes = Vec::new();
        for (idx, line) in self.lines.iter().enumerate() {
            if let Some(caps) = CLASS_RE.captures(line) {
                let indent = caps[1].len();
                let name = caps[2].to_string();
                let end = self.block_end(idx, indent);
                let start = idx + 1;
                let methods: Vec<FunctionBlock> = functions
                    .iter()
                    .filter(|f| f.start > start && f.end <= end && f.indent > indent)
                    .cloned()
                    .collect();
                let has_docstring = self
                    .lines
                    .get(idx + 1..end)
                    .map(|body| {
                        body.iter()
                            .map(|l| l.trim())
                            .find(|l| !l.is_empty())
                            .is_some_and(|l| l.starts_with("\"\"\"") || l.starts_with("'''"))
                    })
                    .unwrap_or(false);
                classes.push(ClassBlock { name, start, end, indent, methods, has_docstring });
            }
        }
        classes
    }

    /// 1-based inclusive end of the block opened at `header_idx` (0-based),
    /// determined by the first subsequent non-blank line at or below the
    /// header's indent.
    fn block_end(&self, header_idx: usize, header_indent: usize) -> usize {
        for (offset, line) in self.lines[header_idx + 1..].iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            if leading_indent(line) <= header_indent {
                return header_idx + 1 + offset;
            }
        }
        self.lines.len()
    }
}

pub fn leading_indent(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Whole-identifier containment: `name` must not be flanked by identifier
/// characters.
pub fn contains_word(haystack: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let bytes = haystack.as_bytes();
    let mut search_from = 0;
    while let Some(pos) = haystack[search_from..].find(name) {
        let start = search_from + pos;
        let end = start + name.len();
        let before_ok = start == 0 || !is_ident_char(bytes[start - 1]);
        let after_ok = end == bytes.len() || !is_ident_char(bytes[end]);
        if before_ok && after_ok {
            return true;
        }
        search_from = start + 1;
    }
    false
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

pub fn module_stem(path: &str) -> &str {
    file_name(path).strip_suffix(".py").unwrap_or(file_name(path))
}

/// True for lines that open a loop.
pub fn is_loop_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("for ") || trimmed.starts_with("while ")
}

/// Deepest loop nesting in `lines`, with the 0-based index of the innermost
/// loop header at that depth.
pub fn max_loop_nesting(lines: &[String]) -> (usize, usize) {
    let mut stack: Vec<usize> = Vec::new();
    let mut max_depth = 0;
    let mut max_line = 0;
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let indent = leading_indent(line);
        while let Some(top) = stack.last() {
            if indent <= *top {
                stack.pop();
            } else {
                break;
            }
        }
        if is_loop_line(line) {
            stack.push(indent);
            if stack.len() > max_depth {
                max_depth = stack.len();
                max_line = idx;
            }
        }
    }
    (max_depth, max_line)
}

/// 0-based indices of lines that sit inside any loop body.
pub fn lines_inside_loops(lines: &[String]) -> Vec<usize> {
    let mut stack: Vec<usize> = Vec::new();
    let mut inside = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let indent = leading_indent(line);
        while let Some(top) = stack.last() {
            if indent <= *top {
                stack.pop();
            } else {
                break;
            }
        }
        if !stack.is_empty() {
            inside.push(idx);
        }
        if is_loop_line(line) {
            stack.push(indent);
        }
    }
    inside
}

/// Load the task's Python artifacts, skipping anything unreadable.
pub fn python_artifacts(task: &Task) -> Vec<SourceFile> {
    task.files_generated
        .iter()
        .filter(|p| p.ends_with(".py"))
        .filter_map(|p| SourceFile::load(p))
        .collect()
}

fn parse_params(raw: &str) -> Vec<Param> {
    split_top_level(raw)
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty() && *p != "self" && *p != "cls" && !p.starts_with('*'))
        .map(|p| {
            let (head, default) = match p.split_once('=') {
                Some((head, _)) => (head.trim(), true),
                None => (p, false),
            };
            let (name, type_hint) = match head.split_once(':') {
                Some((name, hint)) => (name.trim(), Some(hint.trim().to_string())),
                None => (head, None),
            };
            Param { name: name.to_string(), type_hint, has_default: default }
        })
        .collect()
}

fn split_top_level(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in raw.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
"""Module docstring."""

import os


def fetch(url: str, retries: int = 3):
    """Fetch a URL."""
    for attempt in range(retries):
        for chunk in read(url):
            process(chunk)
    return None


class Store:
    """A store."""

    def __init__(self, path):
        self.path = path

    def save(self, record):
        return write(self.path, record)

    def _flush(self):
        pass
"#;

    #[test]
    fn finds_functions_with_params_and_extents() {
        let file = SourceFile::parse("sample.py", SAMPLE);
        let functions = file.module_functions();
        assert_eq!(functions.len(), 1);
        let fetch = &functions[0];
        assert_eq!(fetch.name, "fetch");
        assert_eq!(fetch.params.len(), 2);
        assert_eq!(fetch.params[0].type_hint.as_deref(), Some("str"));
        assert!(fetch.params[1].has_default);
        assert!(fetch.has_docstring);
        assert!(fetch.line_count() >= 5);
    }

    #[test]
    fn finds_classes_with_methods() {
        let file = SourceFile::parse("sample.py", SAMPLE);
        let classes = file.classes();
        assert_eq!(classes.len(), 1);
        let store = &classes[0];
        assert_eq!(store.name, "Store");
        assert!(store.has_docstring);
        let names: Vec<&str> = store.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["__init__", "save", "_flush"]);
    }

    #[test]
    fn module_docstring_detection() {
        let file = SourceFile::parse("sample.py", SAMPLE);
        assert!(file.has_module_docstring());
        let bare = SourceFile::parse("bare.py", "import os\n");
        assert!(!bare.has_module_docstring());
    }

    #[test]
    fn loop_nesting_depth() {
        let file = SourceFile::parse("sample.py", SAMPLE);
        let fetch = &file.module_functions()[0];
        let (depth, _) = max_loop_nesting(fetch.body(&file));
        assert_eq!(depth, 2);

        let flat = SourceFile::parse("f.py", "def f():\n    for x in xs:\n        g(x)\n");
        let f = &flat.module_functions()[0];
        assert_eq!(max_loop_nesting(f.body(&flat)).0, 1);
    }

    #[test]
    fn params_with_nested_generics_split_correctly() {
        let params = parse_params("items: dict[str, list[int]], flag: bool = False");
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "items");
        assert_eq!(params[0].type_hint.as_deref(), Some("dict[str, list[int]]"));
    }

    #[test]
    fn test_file_detection() {
        assert!(SourceFile::parse("test_app.py", "").is_test_file());
        assert!(SourceFile::parse("pkg/tests/helpers.py", "").is_test_file());
        assert!(!SourceFile::parse("app.py", "").is_test_file());
    }
}
