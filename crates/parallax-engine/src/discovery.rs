//! Module discovery.
//!
//! Walks the given roots for directories containing a module manifest. A
//! directory holding a manifest is a module root; the walk does not descend
//! into it further, and hidden directories are skipped.

use std::path::{Path, PathBuf};

use crate::error::EngineResult;
use crate::moduleconfig::{UnvalidatedModuleConfig, MODULE_MANIFEST};

/// Find every module under `roots`, sorted by module name.
pub fn discover_modules(roots: &[PathBuf]) -> EngineResult<Vec<UnvalidatedModuleConfig>> {
    let mut found = Vec::new();
    for root in roots {
        walk(root, &mut found)?;
    }
    found.sort_by(|a, b| a.module.cmp(&b.module));
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<UnvalidatedModuleConfig>) -> EngineResult<()> {
    if dir.join(MODULE_MANIFEST).is_file() {
        found.push(UnvalidatedModuleConfig::load(dir)?);
        return Ok(());
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // A root may not exist yet while watching; treat it as empty.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        dirs.push(entry.path());
    }
    dirs.sort();
    for sub in dirs {
        walk(&sub, found)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(dir: &Path, name: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join(MODULE_MANIFEST),
            format!("module = \"{name}\"\nlanguage = \"go\"\n"),
        )
        .unwrap();
    }

    #[test]
    fn finds_nested_modules_but_not_inside_them() {
        let root = tempfile::tempdir().unwrap();
        module(&root.path().join("echo"), "echo");
        module(&root.path().join("services/time"), "time");
        // A manifest nested inside a module root must not surface.
        module(&root.path().join("echo/vendor/other"), "other");
        std::fs::create_dir_all(root.path().join(".cache/junk")).unwrap();

        let found = discover_modules(&[root.path().to_path_buf()]).unwrap();
        let names: Vec<_> = found.iter().map(|m| m.module.as_str()).collect();
        assert_eq!(names, vec!["echo", "time"]);
    }

    #[test]
    fn missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let gone = root.path().join("nope");
        assert!(discover_modules(&[gone]).unwrap().is_empty());
    }
}
