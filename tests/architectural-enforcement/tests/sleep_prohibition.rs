//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT block a thread with
//! `std::thread::sleep`, and MUST NOT poll with `sleep(..).await`.
//! Periodic work uses `tokio::time::interval`; timeouts race a sleep
//! inside `tokio::select!`, which is allowed.
//!
//! **Exceptions**: test code and the mock provider module, whose simulated
//! latency is the point.

use architectural_enforcement::{production_sources, SourceFile, Violation};

#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<Violation> = production_sources()
        .iter()
        .filter(|file| !file.is_mock())
        .flat_map(find_sleep_violations)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE:");
        eprintln!("  - tokio::time::interval() for periodic tasks");
        eprintln!("  - a sleep arm inside tokio::select! racing shutdown");
        eprintln!("  - tokio::time::timeout() around a call");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - std::thread::sleep anywhere");
        eprintln!("  - sleep(..).await in a polling loop");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

fn find_sleep_violations(file: &SourceFile) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (idx, code) in file.production_lines() {
        if code.contains("thread::sleep(") {
            violations.push(file.violation(idx, "Blocking thread sleep"));
        } else if code.contains("sleep(") && code.contains(".await") {
            violations.push(file.violation(idx, "Sleep-and-poll"));
        }
    }
    violations
}

#[test]
fn test_detector_flags_polling_but_not_select_arms() {
    let src = r#"
async fn poll() {
    loop {
        tokio::time::sleep(d).await;
    }
}

async fn ticker() {
    tokio::select! {
        () = tokio::time::sleep(interval) => {}
    }
}

fn blocking() {
    std::thread::sleep(d);
}
"#;
    let file = SourceFile::parse("x.rs".into(), src);
    let rules: Vec<&str> = find_sleep_violations(&file).iter().map(|v| v.rule).collect();
    assert_eq!(rules, vec!["Sleep-and-poll", "Blocking thread sleep"]);
}
