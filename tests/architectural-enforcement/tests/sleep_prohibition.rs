//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code waits on I/O, channels or deadlines
//! (`tokio::time::timeout`), never on a sleep.
//! **Exceptions**: test code

use architectural_enforcement::{production_dirs, production_lines, report, rust_files};

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for dir in production_dirs() {
        for path in rust_files(&dir) {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for line in production_lines(&path, &content) {
                if line.code.contains("::sleep(") || line.code.contains(".sleep(") {
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
        "CRITICAL: Sleep calls found in production code!",
        &violations,
        &[
            "✅ Wait on the socket, a watch channel or a semaphore instead",
            "✅ Bound waits with tokio::time::timeout",
            "❌ Sleep in polling loops or as synchronization",
        ],
    );
}
