//! Architectural Enforcement Tests
//!
//! Source scans that keep `dockline-core` honest:
//! - No sleeping in production code
//! - No blocking I/O inside async functions
//! - No `unwrap()` / `expect()` / `panic!` outside test modules
//!
//! The scanning helpers live here so every test file shares one notion of
//! what "production code" is.

use std::path::{Path, PathBuf};

/// Production source directories checked by the scans
pub fn production_dirs() -> Vec<PathBuf> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    vec![root.join("dockline/core/src")]
}

/// One line of production code
pub struct SourceLine<'a> {
    /// File the line is in
    pub path: &'a Path,
    /// 1-based line number
    pub number: usize,
    /// Line text with any trailing `//` comment removed
    pub code: &'a str,
    /// Full line text
    pub text: &'a str,
    /// Whether the enclosing function is `async`
    pub in_async_fn: bool,
}

/// Every `.rs` file below `dir`
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect()
}

/// Lines of `content` that precede its `#[cfg(test)]` module
///
/// Doc comments and line comments are skipped.
pub fn production_lines<'a>(path: &'a Path, content: &'a str) -> Vec<SourceLine<'a>> {
    let lines: Vec<&str> = content.lines().collect();
    let mut out = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        out.push(SourceLine {
            path,
            number: idx + 1,
            code: line.split("//").next().unwrap_or(line),
            text: line.trim(),
            in_async_fn: is_in_async_function(&lines, idx),
        });
    }
    out
}

/// Whether the nearest enclosing `fn` above `current_idx` is async
pub fn is_in_async_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..=current_idx).rev() {
        let line = lines[i].trim();
        if line.starts_with("//") {
            continue;
        }
        if line.contains("async fn ") || line.contains("async move") {
            return true;
        }
        if line.starts_with("fn ") || line.contains(" fn ") {
            return false;
        }
        if line.starts_with("impl ") || line.starts_with("mod ") {
            return false;
        }
    }
    false
}

/// Render violations and panic if there are any
pub fn report(title: &str, violations: &[String], guidance: &[&str]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    eprintln!();
    for line in guidance {
        eprintln!("  {line}");
    }
    panic!(
        "\nFound {} violation(s) in production code.\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_function_detection() {
        let code = vec![
            "async fn bad_function() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];
        assert!(is_in_async_function(&code, 1));
    }

    #[test]
    fn test_sync_function_detection() {
        let code = vec![
            "pub fn from_dir(dir: &Path) -> Result<Self> {",
            "    let contents = std::fs::read(dir)?;",
            "}",
        ];
        assert!(!is_in_async_function(&code, 1));
    }

    #[test]
    fn test_test_module_is_not_production() {
        let content = "fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() { x.unwrap(); }\n}\n";
        let path = Path::new("lib.rs");
        let lines = production_lines(path, content);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].number, 1);
    }

    #[test]
    fn test_production_dirs_exist() {
        for dir in production_dirs() {
            assert!(dir.exists(), "{} is missing", dir.display());
        }
    }
}
