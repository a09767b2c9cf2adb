//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the tests in `tests/`. They enforce:
//! - No blocking sleeps, and no sleep-then-poll loops in production code
//! - No blocking I/O inside async functions
//! - No blocking HTTP client anywhere
//!
//! The scanners are line-based heuristics, not a Rust parser. They are
//! tuned to the layout rustfmt produces.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source trees checked by every rule
pub const PRODUCTION_DIRS: &[&str] = &["airouter/core/src", "airouter/daemon/src"];

/// Mock modules compiled into the library for integration tests
pub const MOCK_FILES: &[&str] = &["test_utils.rs"];

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub rule: &'static str,
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.text
        )
    }
}

/// A loaded source file with its test regions marked
pub struct SourceFile {
    pub path: PathBuf,
    lines: Vec<String>,
    in_test: Vec<bool>,
}

impl SourceFile {
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(path.to_path_buf(), &content))
    }

    pub fn parse(path: PathBuf, content: &str) -> Self {
        let lines: Vec<String> = content.lines().map(str::to_string).collect();
        let in_test = mark_test_regions(&lines);
        Self {
            path,
            lines,
            in_test,
        }
    }

    pub fn is_mock(&self) -> bool {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| MOCK_FILES.contains(&name))
    }

    /// Non-test lines with comments stripped, as `(index, code)`
    pub fn production_lines(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.lines
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.in_test[*idx])
            .map(|(idx, line)| (idx, strip_comment(line)))
            .filter(|(_, code)| !code.trim().is_empty())
    }

    pub fn lines(&self) -> Vec<&str> {
        self.lines.iter().map(String::as_str).collect()
    }

    pub fn violation(&self, idx: usize, rule: &'static str) -> Violation {
        Violation {
            path: self.path.clone(),
            line: idx + 1,
            rule,
            text: self.lines[idx].trim().to_string(),
        }
    }
}

/// Workspace root, resolved from this crate's manifest
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// All `.rs` files under the production trees
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                if let Some(file) = SourceFile::load(entry.path()) {
                    files.push(file);
                }
            }
        }
    }
    files
}

/// Drop a trailing `//` comment, ignoring `//` inside string literals
pub fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut prev = '\0';
    for (i, c) in line.char_indices() {
        match c {
            '"' if prev != '\\' => in_string = !in_string,
            '/' if !in_string && prev == '/' => return &line[..i - 1],
            _ => {}
        }
        prev = c;
    }
    line
}

/// Whether a trimmed line opens a function
pub fn is_fn_header(trimmed: &str) -> bool {
    let mut rest = trimmed;
    for prefix in ["pub(crate) ", "pub(super) ", "pub ", "const ", "unsafe ", "async "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    rest.starts_with("fn ")
}

/// Whether the function enclosing `idx` is `async`
///
/// Async blocks inside sync functions count as async too.
pub fn is_in_async_context(lines: &[&str], idx: usize) -> bool {
    for i in (0..=idx).rev() {
        let line = strip_comment(lines[i]);
        if line.contains("async move") || line.contains("async {") {
            return true;
        }
        let trimmed = line.trim();
        if is_fn_header(trimmed) {
            return trimmed.contains("async fn ");
        }
        if trimmed.starts_with("mod ") || (trimmed.starts_with("impl") && trimmed.contains('{')) {
            return false;
        }
    }
    false
}

/// Mark every line inside a `#[cfg(test)]` item
fn mark_test_regions(lines: &[String]) -> Vec<bool> {
    let mut marks = vec![false; lines.len()];
    let mut idx = 0;
    while idx < lines.len() {
        if lines[idx].trim() != "#[cfg(test)]" {
            idx += 1;
            continue;
        }
        let start = idx;
        let mut depth: i64 = 0;
        let mut opened = false;
        while idx < lines.len() {
            for c in strip_comment(&lines[idx]).chars() {
                match c {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            // A braceless item (`use`, `mod foo;`) ends at its semicolon
            let ends_braceless = !opened && lines[idx].trim_end().ends_with(';');
            idx += 1;
            if (opened && depth <= 0) || ends_braceless {
                break;
            }
        }
        for mark in &mut marks[start..idx] {
            *mark = true;
        }
    }
    marks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comment_keeps_urls_in_strings() {
        assert_eq!(strip_comment("let a = 1; // note"), "let a = 1; ");
        assert_eq!(
            strip_comment(r#"let u = "http://x"; // c"#),
            r#"let u = "http://x"; "#
        );
    }

    #[test]
    fn test_test_module_is_excluded() {
        let src = "fn real() {\n    work();\n}\n\n#[cfg(test)]\nmod tests {\n    fn t() {\n        std::thread::sleep(d);\n    }\n}\n";
        let file = SourceFile::parse(PathBuf::from("x.rs"), src);
        let code: Vec<&str> = file.production_lines().map(|(_, c)| c).collect();
        assert!(code.iter().any(|c| c.contains("work()")));
        assert!(!code.iter().any(|c| c.contains("sleep")));
    }

    #[test]
    fn test_cfg_test_use_is_single_line() {
        let src = "#[cfg(test)]\nuse std::time::Duration;\nfn f() {}\n";
        let file = SourceFile::parse(PathBuf::from("x.rs"), src);
        let code: Vec<&str> = file.production_lines().map(|(_, c)| c).collect();
        assert_eq!(code, vec!["fn f() {}"]);
    }

    #[test]
    fn test_async_context_detection() {
        let lines = vec![
            "    pub async fn run(&self) {",
            "        let x = std::fs::read(p);",
            "    }",
            "    fn prepare(&self) {",
            "        std::fs::remove_file(p);",
            "        tokio::spawn(async move {",
            "            std::fs::read(p);",
            "        });",
            "    }",
        ];
        assert!(is_in_async_context(&lines, 1));
        assert!(!is_in_async_context(&lines, 4));
        assert!(is_in_async_context(&lines, 6));
    }

    #[test]
    fn test_fn_header() {
        assert!(is_fn_header("pub(crate) async fn go() {"));
        assert!(is_fn_header("fn go() {"));
        assert!(!is_fn_header("let fn_name = 1;"));
    }
}
