//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async functions in production code MUST NOT use blocking I/O.
//! **Required**: `tokio::fs`, `tokio::net`, `tokio::io`
//! **Acceptable**: blocking calls in plain `fn`s (configuration loading)

use architectural_enforcement::{production_dirs, production_lines, report, rust_files};

const FORBIDDEN: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin"),
    ("std::thread::sleep", "Blocking sleep"),
];

#[test]
fn test_no_blocking_io_in_async_code() {
    let mut violations = Vec::new();

    for dir in production_dirs() {
        for path in rust_files(&dir) {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for line in production_lines(&path, &content) {
                if !line.in_async_fn {
                    continue;
                }
                for (pattern, what) in FORBIDDEN {
                    if line.code.contains(pattern) {
                        violations.push(format!(
                            "{}:{} - {what}: {}",
                            line.path.display(),
                            line.number,
                            line.text
                        ));
                    }
                }
            }
        }
    }

    report(
        "CRITICAL: Blocking I/O calls found in async production code!",
        &violations,
        &[
            "✅ tokio::fs::metadata().await, tokio::net::TcpStream::connect().await",
            "✅ tokio::io::AsyncRead / AsyncWrite",
        ],
    );
}
