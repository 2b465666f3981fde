// Copyright 2025 the ts-gateway authors. MIT license.

use std::path::Path;
use std::path::PathBuf;

use walkdir::WalkDir;

/// Walks `root` collecting files whose final path segment equals
/// `file_name`, pruning any directory whose name appears in
/// `ignore_dirs`. Entries come back in deterministic path order.
pub fn find_files_named(
  root: &Path,
  file_name: &str,
  ignore_dirs: &[&str],
) -> Vec<PathBuf> {
  let mut results = Vec::new();
  let walker = WalkDir::new(root).sort_by_file_name().into_iter();
  let ignored = |entry: &walkdir::DirEntry| {
    entry.file_type().is_dir()
      && entry
        .file_name()
        .to_str()
        .map(|name| ignore_dirs.contains(&name))
        .unwrap_or(false)
  };
  for entry in walker.filter_entry(|e| !ignored(e)).flatten() {
    if entry.file_type().is_file() && entry.file_name() == file_name {
      results.push(entry.into_path());
    }
  }
  results
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn find_files_named_prunes_ignored_dirs() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("a/node_modules/x")).unwrap();
    std::fs::create_dir_all(root.join("b")).unwrap();
    std::fs::write(root.join("a/tsconfig.json"), "{}").unwrap();
    std::fs::write(root.join("a/node_modules/x/tsconfig.json"), "{}").unwrap();
    std::fs::write(root.join("b/tsconfig.json"), "{}").unwrap();
    let found = find_files_named(root, "tsconfig.json", &["node_modules"]);
    assert_eq!(
      found,
      vec![root.join("a/tsconfig.json"), root.join("b/tsconfig.json")]
    );
  }

}
