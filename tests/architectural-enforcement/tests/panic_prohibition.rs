//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production code propagates errors with `Result` and `?`.
//! `unwrap()`, `expect()`, `panic!`, `todo!` and `unimplemented!` are only
//! allowed in test modules.

use architectural_enforcement::{production_dirs, production_lines, report, rust_files};

const FORBIDDEN: &[&str] = &[".unwrap()", ".expect(", "panic!(", "todo!(", "unimplemented!("];

#[test]
fn test_no_panics_in_production_code() {
    let mut violations = Vec::new();

    for dir in production_dirs() {
        for path in rust_files(&dir) {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for line in production_lines(&path, &content) {
                if FORBIDDEN.iter().any(|p| line.code.contains(p)) {
                    violations.push(format!(
                        "{}:{} - {}",
                        line.path.display(),
                        line.number,
                        line.text
                    ));
                }
            }
        }
    }

    report(
        "CRITICAL: Panicking calls found in production code!",
        &violations,
        &[
            "✅ Return a Result and use ?",
            "✅ Use unwrap_or / unwrap_or_else / map_or for real defaults",
        ],
    );
}
