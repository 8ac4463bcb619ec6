//! Naming and module size checks.
//!
//! Scans every Rust file in the tribe crates for the violations that clippy
//! does not catch: oversized modules, catch-all module names, accessor
//! prefixes and role-only type names.

use std::fs;
use std::path::{Path, PathBuf};

/// Modules past this point get split.
const MAX_MODULE_LINES: usize = 500;

const BANNED_MODULE_NAMES: &[&str] = &[
    "utils", "util", "helpers", "helper", "common", "shared", "misc", "tools",
];

const BANNED_FUNCTION_PREFIXES: &[(&str, &str)] = &[
    ("get_", "Use the noun directly: handle.state() not handle.get_state()"),
    ("set_", "Name the transition: ctx.enter_state() not ctx.set_state()"),
];

const BANNED_TYPE_SUFFIXES: &[&str] = &["Factory", "Service", "Manager", "Processor", "Controller"];

#[derive(Debug)]
struct Violation {
    file_path: String,
    line_number: usize,
    message: String,
}

fn find_rust_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if let Some(name) = dir.file_name() {
        let name = name.to_string_lossy();
        if name == "target" || name == "examples" || name.starts_with('.') {
            return Ok(());
        }
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            find_rust_files(&path, files)?;
        } else if path.extension().is_some_and(|extension| extension == "rs") {
            files.push(path);
        }
    }
    Ok(())
}

fn workspace_files() -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in fs::read_dir("..").expect("workspace root readable") {
        let path = entry.expect("directory entry").path();
        let is_tribe_crate = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with("tribe-"));
        if path.is_dir() && is_tribe_crate {
            find_rust_files(&path, &mut files).expect("crate directory readable");
        }
    }
    assert!(!files.is_empty(), "no tribe sources found from {:?}", std::env::current_dir());
    files
}

fn check_file(path: &Path, content: &str, violations: &mut Vec<Violation>) {
    let file_path = path.display().to_string();

    let line_count = content.lines().count();
    if line_count > MAX_MODULE_LINES {
        violations.push(Violation {
            file_path: file_path.clone(),
            line_number: line_count,
            message: format!("{line_count} lines, limit is {MAX_MODULE_LINES}"),
        });
    }

    if let Some(stem) = path.file_stem().map(|stem| stem.to_string_lossy())
        && BANNED_MODULE_NAMES.contains(&stem.as_ref())
    {
        violations.push(Violation {
            file_path: file_path.clone(),
            line_number: 0,
            message: format!("module name '{stem}' says nothing about its contents"),
        });
    }

    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") {
            continue;
        }

        for &(prefix, correction) in BANNED_FUNCTION_PREFIXES {
            if trimmed.contains(&format!("fn {prefix}")) {
                violations.push(Violation {
                    file_path: file_path.clone(),
                    line_number: index + 1,
                    message: format!("function uses banned prefix '{prefix}'. {correction}"),
                });
            }
        }

        let declaration = ["pub struct ", "struct ", "pub enum ", "enum ", "pub trait ", "trait "]
            .iter()
            .find_map(|keyword| trimmed.strip_prefix(keyword));
        if let Some(rest) = declaration {
            let type_name = rest
                .split(|c: char| !c.is_alphanumeric() && c != '_')
                .next()
                .unwrap_or("");
            for suffix in BANNED_TYPE_SUFFIXES {
                if type_name.ends_with(suffix) {
                    violations.push(Violation {
                        file_path: file_path.clone(),
                        line_number: index + 1,
                        message: format!("type '{type_name}' named after a role ('{suffix}')"),
                    });
                }
            }
        }
    }
}

#[test]
fn test_naming_and_module_size() {
    let mut violations = Vec::new();
    let files = workspace_files();

    for path in &files {
        let content = fs::read_to_string(path).expect("source file readable");
        check_file(path, &content, &mut violations);
    }

    for violation in &violations {
        eprintln!(
            "{}:{}: {}",
            violation.file_path, violation.line_number, violation.message
        );
    }
    assert!(
        violations.is_empty(),
        "{} style violations in {} files",
        violations.len(),
        files.len()
    );
}

#[test]
fn test_checker_flags_accessor_prefix() {
    let mut violations = Vec::new();
    check_file(
        Path::new("tribe-core/src/example.rs"),
        &format!("pub fn {}port(&self) -> u16 {{\n    self.port\n}}\n", "get_"),
        &mut violations,
    );
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].line_number, 1);
}
