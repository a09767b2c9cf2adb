//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code MUST NOT perform blocking I/O.
//! **Required**: `tokio::fs`, `tokio::net`, async `reqwest`.
//!
//! Blocking `std::fs` is fine in sync functions that run before the
//! runtime serves traffic (config loading, PID files, socket setup). The
//! routing engine itself performs no file or network I/O of its own: it
//! reaches providers only through adapters.

use architectural_enforcement::{
    is_in_async_context, production_sources, workspace_root, SourceFile, Violation,
};

#[test]
fn test_no_blocking_io_in_production_code() {
    let violations: Vec<Violation> = production_sources()
        .iter()
        .flat_map(find_blocking_io_violations)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - std::fs / std::net calls inside async functions");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("  - any file or network I/O in the routing engine");
        eprintln!("\n✅ REQUIRED:");
        eprintln!("  - tokio::fs, tokio::net, reqwest async client");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}

fn is_routing_engine(file: &SourceFile) -> bool {
    let routing = workspace_root().join("airouter/core/src/routing");
    file.path.starts_with(routing)
}

fn find_blocking_io_violations(file: &SourceFile) -> Vec<Violation> {
    let lines = file.lines();
    let engine = is_routing_engine(file);
    let mut violations = Vec::new();

    for (idx, code) in file.production_lines() {
        if code.contains("reqwest::blocking") {
            violations.push(file.violation(idx, "Blocking HTTP client"));
            continue;
        }

        let uses_std_io = code.contains("std::fs")
            || code.contains("std::net")
            || code.contains("fs::read")
            || code.contains("fs::write")
            || code.contains("fs::remove_file")
            || code.contains("fs::create_dir")
            || code.contains("fs::File::");
        if !uses_std_io || code.contains("tokio::") {
            continue;
        }

        if engine {
            violations.push(file.violation(idx, "I/O in routing engine"));
        } else if is_in_async_context(&lines, idx) {
            violations.push(file.violation(idx, "Blocking I/O in async"));
        }
    }
    violations
}

#[test]
fn test_detector_allows_sync_setup_only() {
    let src = r#"
use std::fs;

fn load(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

async fn serve(path: &Path) {
    let body = fs::read_to_string(path);
    let ok = tokio::fs::read_to_string(path).await;
}
"#;
    let file = SourceFile::parse("daemon.rs".into(), src);
    let found = find_blocking_io_violations(&file);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].line, 9);
    assert_eq!(found[0].rule, "Blocking I/O in async");
}

#[test]
fn test_detector_flags_blocking_client_anywhere() {
    let src = "fn fetch() {\n    let r = reqwest::blocking::get(url);\n}\n";
    let file = SourceFile::parse("client.rs".into(), src);
    let found = find_blocking_io_violations(&file);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].rule, "Blocking HTTP client");
}
