// Copyright 2025 the ts-gateway authors. MIT license.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

fn is_true() -> bool {
  true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSettings {
  /// Forward downstream diagnostics to the client.
  #[serde(default)]
  pub enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypeScriptSettings {
  #[serde(default)]
  pub diagnostics: DiagnosticsSettings,
  /// Emit `$/progress` notifications while materializing the
  /// workspace. Only effective when the client advertises the
  /// capability.
  #[serde(default = "is_true")]
  pub progress: bool,
  #[serde(default = "is_true")]
  pub restart_after_dependency_installation: bool,
  /// Registry configuration handed to the dependency installer,
  /// serialized into the session `.npmrc`.
  #[serde(default)]
  pub npmrc: Option<Value>,
  /// Instance used when rewriting locations into external
  /// repositories.
  #[serde(default)]
  pub sourcegraph_url: Option<String>,
  /// Bearer credential carried in the userinfo of external-repo
  /// URLs and on raw resource fetches.
  #[serde(default)]
  pub access_token: Option<String>,
}

impl Default for TypeScriptSettings {
  fn default() -> Self {
    Self {
      diagnostics: Default::default(),
      progress: true,
      restart_after_dependency_installation: true,
      npmrc: None,
      sourcegraph_url: None,
      access_token: None,
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
  #[serde(default)]
  pub typescript: TypeScriptSettings,
}

impl Settings {
  /// Lifts `initializationOptions.configuration` into session
  /// settings. Anything malformed falls back to defaults with a
  /// warning so a bad client cannot fail the session.
  pub fn from_initialization_options(options: Option<&Value>) -> Self {
    let Some(configuration) =
      options.and_then(|o| o.get("configuration")).cloned()
    else {
      return Self::default();
    };
    match serde_json::from_value(configuration) {
      Ok(settings) => settings,
      Err(err) => {
        crate::logging::lsp_warn!(
          "Could not parse session configuration: {}",
          err
        );
        Self::default()
      }
    }
  }

  /// Serializes the `typescript.npmrc` object as `key=value` lines
  /// for the `.npmrc` handed to the installer via `--userconfig`.
  pub fn npmrc_contents(&self) -> Option<String> {
    let npmrc = self.typescript.npmrc.as_ref()?.as_object()?;
    let mut lines = String::new();
    for (key, value) in npmrc {
      let value = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      lines.push_str(&format!("{}={}\n", key, value));
    }
    Some(lines)
  }

  /// The registry base URL from `typescript.npmrc`, when configured.
  pub fn npm_registry_url(&self) -> Option<&str> {
    self
      .typescript
      .npmrc
      .as_ref()?
      .get("registry")?
      .as_str()
  }
}
