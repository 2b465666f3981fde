// Copyright 2025 the ts-gateway authors. MIT license.

use std::path::Path;

use serde_json::Value;

use crate::errors::AnyError;
use crate::logging::lsp_debug;
use crate::logging::lsp_warn;
use crate::util::fs::find_files_named;

/// Parses a `tsconfig.json` leniently (comments and trailing commas
/// allowed) and strips `compilerOptions.plugins`. Plugins resolve
/// out of the untrusted materialized `node_modules` and must never
/// execute. Returns the rewritten text, or `None` when the file holds
/// no JSON object.
pub fn sanitize_tsconfig_text(text: &str) -> Result<Option<String>, AnyError> {
  let value = jsonc_parser::parse_to_serde_value(text, &jsonc_parser::ParseOptions::default())
    .map_err(|err| anyhow::anyhow!("invalid tsconfig: {}", err))?;
  let Some(mut value) = value else {
    return Ok(None);
  };
  if let Some(compiler_options) =
    value.get_mut("compilerOptions").and_then(Value::as_object_mut)
  {
    compiler_options.remove("plugins");
  }
  Ok(Some(serde_json::to_string_pretty(&value)?))
}

/// Rewrites every `tsconfig.json` under `root`. Per-file failures are
/// logged and skipped so one broken config cannot stop the pass.
/// Returns the number of files rewritten.
pub fn sanitize_tsconfigs_under(root: &Path) -> usize {
  let mut rewritten = 0;
  for path in find_files_named(root, "tsconfig.json", &[]) {
    let text = match std::fs::read_to_string(&path) {
      Ok(text) => text,
      Err(err) => {
        lsp_warn!("Could not read '{}': {}", path.display(), err);
        continue;
      }
    };
    match sanitize_tsconfig_text(&text) {
      Ok(Some(sanitized)) => {
        if let Err(err) = std::fs::write(&path, sanitized) {
          lsp_warn!("Could not rewrite '{}': {}", path.display(), err);
        } else {
          rewritten += 1;
        }
      }
      Ok(None) => {}
      Err(err) => {
        lsp_warn!("Skipping '{}': {}", path.display(), err);
      }
    }
  }
  lsp_debug!("Sanitized {} tsconfig file(s) under {}", rewritten, root.display());
  rewritten
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strips_plugins_and_keeps_the_rest() {
    let text = r#"{
      // project config
      "compilerOptions": {
        "strict": true,
        "plugins": [{ "name": "evil-plugin" }],
      },
      "include": ["src"],
    }"#;
    let sanitized = sanitize_tsconfig_text(text).unwrap().unwrap();
    let value: Value = serde_json::from_str(&sanitized).unwrap();
    assert_eq!(value["compilerOptions"]["strict"], Value::Bool(true));
    assert!(value["compilerOptions"].get("plugins").is_none());
    assert_eq!(value["include"][0], "src");
  }

  #[test]
  fn tolerates_configs_without_compiler_options() {
    let sanitized =
      sanitize_tsconfig_text(r#"{ "extends": "./base.json" }"#)
        .unwrap()
        .unwrap();
    let value: Value = serde_json::from_str(&sanitized).unwrap();
    assert_eq!(value["extends"], "./base.json");
  }

  #[test]
  fn empty_file_is_left_alone() {
    assert!(sanitize_tsconfig_text("").unwrap().is_none());
  }

  #[test]
  fn rewrites_files_in_place() {
    let dir = tempfile::TempDir::new().unwrap();
    let nested = dir.path().join("node_modules/pkg");
    std::fs::create_dir_all(&nested).unwrap();
    std::fs::write(
      nested.join("tsconfig.json"),
      r#"{ "compilerOptions": { "plugins": [] } }"#,
    )
    .unwrap();
    std::fs::write(dir.path().join("tsconfig.json"), "not json at all")
      .unwrap();
    let rewritten = sanitize_tsconfigs_under(dir.path());
    assert_eq!(rewritten, 1);
    let text =
      std::fs::read_to_string(nested.join("tsconfig.json")).unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();
    assert!(value["compilerOptions"].get("plugins").is_none());
  }
}
