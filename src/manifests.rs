// Copyright 2025 the ts-gateway authors. MIT license.

use std::sync::Arc;

use url::Url;

use crate::errors::AnyError;
use crate::logging::lsp_warn;
use crate::package_json::PackageJson;
use crate::urls::ensure_trailing_slash;
use crate::urls::WorkspaceUrls;

/// A directory under the HTTP root that holds a package manifest.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
  /// Directory URL with a trailing slash.
  pub dir: Url,
  pub manifest: Arc<PackageJson>,
}

/// Set of package-manifest directories recorded while materializing
/// the workspace. Built once at initialize and never mutated.
#[derive(Debug, Default)]
pub struct ManifestRegistry {
  entries: Vec<ManifestEntry>,
}

impl ManifestRegistry {
  /// Reads every recorded manifest off disk. Manifests that fail to
  /// parse are logged and dropped rather than failing initialize.
  pub fn build(manifest_dirs: Vec<Url>, urls: &WorkspaceUrls) -> Self {
    let mut entries = Vec::new();
    for dir in manifest_dirs {
      let dir = ensure_trailing_slash(dir);
      let manifest_url = match urls.http_to_file(&dir) {
        Ok(file_dir) => file_dir.join("package.json").ok(),
        Err(_) => None,
      };
      let Some(manifest_url) = manifest_url else {
        lsp_warn!("Manifest directory outside the workspace: {}", dir);
        continue;
      };
      let Ok(path) = manifest_url.to_file_path() else {
        continue;
      };
      let manifest = std::fs::read(&path)
        .map_err(AnyError::from)
        .and_then(|bytes| PackageJson::from_slice(&bytes));
      match manifest {
        Ok(manifest) => entries.push(ManifestEntry {
          dir,
          manifest: Arc::new(manifest),
        }),
        Err(err) => {
          lsp_warn!("Could not read manifest at '{}': {:#}", dir, err);
        }
      }
    }
    Self { entries }
  }

  pub fn from_entries(entries: Vec<ManifestEntry>) -> Self {
    Self { entries }
  }

  /// Entries whose directory is a path prefix of `url`.
  pub fn parents_of(&self, url: &Url) -> Vec<&ManifestEntry> {
    self
      .entries
      .iter()
      .filter(|entry| url.as_str().starts_with(entry.dir.as_str()))
      .collect()
  }

  /// Entries whose manifest declares `package` in `dependencies` or
  /// `devDependencies`.
  pub fn declared_in(&self, package: &str) -> Vec<&ManifestEntry> {
    self
      .entries
      .iter()
      .filter(|entry| entry.manifest.declares(package))
      .collect()
  }

  /// Snapshot for concurrent traversal.
  pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
    self.entries.iter()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn entry(dir: &str, manifest: serde_json::Value) -> ManifestEntry {
    ManifestEntry {
      dir: Url::parse(dir).unwrap(),
      manifest: Arc::new(serde_json::from_value(manifest).unwrap()),
    }
  }

  fn registry() -> ManifestRegistry {
    ManifestRegistry::from_entries(vec![
      entry(
        "https://h/repo@abc/-/raw/",
        json!({ "dependencies": { "lodash": "*" } }),
      ),
      entry(
        "https://h/repo@abc/-/raw/packages/app/",
        json!({ "devDependencies": { "other-pkg": "^1" } }),
      ),
    ])
  }

  #[test]
  fn parents_of_matches_prefix_entries() {
    let registry = registry();
    let doc =
      Url::parse("https://h/repo@abc/-/raw/packages/app/src/a.ts").unwrap();
    let parents = registry.parents_of(&doc);
    assert_eq!(parents.len(), 2);

    let top = Url::parse("https://h/repo@abc/-/raw/b.ts").unwrap();
    assert_eq!(registry.parents_of(&top).len(), 1);

    let outside = Url::parse("https://h/other/-/raw/b.ts").unwrap();
    assert!(registry.parents_of(&outside).is_empty());
  }

  #[test]
  fn declared_in_consults_both_dependency_tables() {
    let registry = registry();
    assert_eq!(registry.declared_in("lodash").len(), 1);
    let declaring = registry.declared_in("other-pkg");
    assert_eq!(declaring.len(), 1);
    assert!(declaring[0].dir.as_str().ends_with("packages/app/"));
    assert!(registry.declared_in("left-pad").is_empty());
  }

  #[test]
  fn build_reads_manifests_from_disk_and_skips_broken_ones() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("sub")).unwrap();
    std::fs::write(
      dir.path().join("package.json"),
      r#"{ "dependencies": { "lodash": "*" } }"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("sub/package.json"), "not json").unwrap();

    let http_root = Url::parse("https://h/repo@abc/-/raw/").unwrap();
    let urls = WorkspaceUrls::new(
      http_root.clone(),
      Url::from_directory_path(dir.path()).unwrap(),
    );
    let registry = ManifestRegistry::build(
      vec![http_root.clone(), http_root.join("sub/").unwrap()],
      &urls,
    );
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.declared_in("lodash").len(), 1);
  }
}
