// Copyright 2025 the ts-gateway authors. MIT license.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::errors::AnyError;

/// The manifest `repository` field, either shorthand or an object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Repository {
  Shorthand(String),
  Info {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
    url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    directory: Option<String>,
  },
}

impl Repository {
  pub fn url(&self) -> &str {
    match self {
      Repository::Shorthand(url) => url,
      Repository::Info { url, .. } => url,
    }
  }

  pub fn directory(&self) -> Option<&str> {
    match self {
      Repository::Shorthand(_) => None,
      Repository::Info { directory, .. } => directory.as_deref(),
    }
  }
}

/// A package manifest. Fields the gateway does not interpret are
/// preserved through `rest` so a filtered manifest can be written
/// back without dropping anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackageJson {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
  #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
  pub dependencies: IndexMap<String, String>,
  #[serde(
    default,
    rename = "devDependencies",
    skip_serializing_if = "IndexMap::is_empty"
  )]
  pub dev_dependencies: IndexMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub types: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub typings: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub repository: Option<Repository>,
  #[serde(
    default,
    rename = "gitHead",
    skip_serializing_if = "Option::is_none"
  )]
  pub git_head: Option<String>,
  #[serde(flatten)]
  pub rest: serde_json::Map<String, Value>,
}

impl PackageJson {
  pub fn from_slice(bytes: &[u8]) -> Result<Self, AnyError> {
    Ok(serde_json::from_slice(bytes)?)
  }

  pub fn to_pretty_string(&self) -> Result<String, AnyError> {
    Ok(serde_json::to_string_pretty(self)?)
  }

  /// Whether this manifest declares `package` as a dependency or
  /// dev dependency.
  pub fn declares(&self, package: &str) -> bool {
    self.dependencies.contains_key(package)
      || self.dev_dependencies.contains_key(package)
  }

  /// Whether the published package carries type declarations of its
  /// own.
  pub fn has_types(&self) -> bool {
    self.types.is_some() || self.typings.is_some()
  }

  pub fn dependency_count(&self) -> usize {
    self.dependencies.len() + self.dev_dependencies.len()
  }
}
