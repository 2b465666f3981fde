// Copyright 2025 the ts-gateway authors. MIT license.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;
use walkdir::WalkDir;

use crate::errors::check_cancelled;
use crate::errors::AnyError;
use crate::errors::ResourceNotFound;

/// Capability set the session consumes for reading resources. Picked
/// by URI scheme through [`ResourceProvider`].
#[async_trait]
pub trait ResourceRetriever: Send + Sync {
  /// Reads a resource. Signals [`ResourceNotFound`] when the target
  /// is absent; any other failure is transport-level.
  async fn fetch(
    &self,
    url: &Url,
    token: &CancellationToken,
  ) -> Result<Vec<u8>, AnyError>;

  async fn exists(
    &self,
    url: &Url,
    token: &CancellationToken,
  ) -> Result<bool, AnyError>;

  /// Matches `pattern` against paths under `root`, skipping
  /// directories named in `ignore`. Results come back in path order.
  async fn glob(
    &self,
    root: &Url,
    pattern: &str,
    ignore: &[&str],
    token: &CancellationToken,
  ) -> Result<Vec<Url>, AnyError>;
}

/// Local filesystem retriever for `file:` URLs.
#[derive(Debug, Default)]
pub struct FileRetriever;

fn url_to_path(url: &Url) -> Result<PathBuf, AnyError> {
  url
    .to_file_path()
    .map_err(|_| anyhow::anyhow!("not a file path: {}", url))
}

#[async_trait]
impl ResourceRetriever for FileRetriever {
  async fn fetch(
    &self,
    url: &Url,
    token: &CancellationToken,
  ) -> Result<Vec<u8>, AnyError> {
    check_cancelled(token)?;
    let path = url_to_path(url)?;
    match tokio::fs::read(&path).await {
      Ok(bytes) => Ok(bytes),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
        Err(ResourceNotFound(url.clone()).into())
      }
      Err(err) => Err(err.into()),
    }
  }

  async fn exists(
    &self,
    url: &Url,
    token: &CancellationToken,
  ) -> Result<bool, AnyError> {
    check_cancelled(token)?;
    let path = url_to_path(url)?;
    Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
  }

  async fn glob(
    &self,
    root: &Url,
    pattern: &str,
    ignore: &[&str],
    token: &CancellationToken,
  ) -> Result<Vec<Url>, AnyError> {
    check_cancelled(token)?;
    let root_path = url_to_path(root)?;
    let pattern = glob::Pattern::new(pattern)?;
    let ignore: Vec<String> =
      ignore.iter().map(|name| name.to_string()).collect();
    let matches = tokio::task::spawn_blocking(move || {
      glob_dir(&root_path, &pattern, &ignore)
    })
    .await??;
    matches
      .into_iter()
      .map(|path| {
        Url::from_file_path(&path)
          .map_err(|_| anyhow::anyhow!("unrepresentable path"))
      })
      .collect()
  }
}

fn glob_dir(
  root: &Path,
  pattern: &glob::Pattern,
  ignore: &[String],
) -> Result<Vec<PathBuf>, AnyError> {
  let options = glob::MatchOptions {
    require_literal_separator: true,
    ..Default::default()
  };
  let ignored = |entry: &walkdir::DirEntry| {
    entry.file_type().is_dir()
      && entry
        .file_name()
        .to_str()
        .map(|name| ignore.iter().any(|i| i == name))
        .unwrap_or(false)
  };
  let mut results = Vec::new();
  let walker = WalkDir::new(root).sort_by_file_name().into_iter();
  for entry in walker.filter_entry(|e| !ignored(e)).flatten() {
    if !entry.file_type().is_file() {
      continue;
    }
    let Ok(rel) = entry.path().strip_prefix(root) else {
      continue;
    };
    if pattern.matches_path_with(rel, options) {
      results.push(entry.into_path());
    }
  }
  Ok(results)
}

/// Raw HTTP retriever for `http(s):` URLs, carrying the session
/// bearer credential.
#[derive(Debug)]
pub struct HttpRetriever {
  client: reqwest::Client,
  access_token: Option<String>,
}

impl HttpRetriever {
  pub fn new(client: reqwest::Client, access_token: Option<String>) -> Self {
    Self {
      client,
      access_token,
    }
  }

  fn get(&self, url: &Url) -> reqwest::RequestBuilder {
    let mut builder = self.client.get(url.clone());
    if let Some(token) = &self.access_token {
      builder = builder.bearer_auth(token);
    }
    builder
  }
}

#[async_trait]
impl ResourceRetriever for HttpRetriever {
  async fn fetch(
    &self,
    url: &Url,
    token: &CancellationToken,
  ) -> Result<Vec<u8>, AnyError> {
    check_cancelled(token)?;
    let response = self.get(url).send().await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Err(ResourceNotFound(url.clone()).into());
    }
    let response = response.error_for_status()?;
    check_cancelled(token)?;
    Ok(response.bytes().await?.to_vec())
  }

  async fn exists(
    &self,
    url: &Url,
    token: &CancellationToken,
  ) -> Result<bool, AnyError> {
    check_cancelled(token)?;
    let response = self.get(url).send().await?;
    Ok(response.status().is_success())
  }

  async fn glob(
    &self,
    _root: &Url,
    _pattern: &str,
    _ignore: &[&str],
    _token: &CancellationToken,
  ) -> Result<Vec<Url>, AnyError> {
    anyhow::bail!("glob is not supported over http")
  }
}

/// Scheme-indexed retriever registry.
pub struct ResourceProvider {
  file: Arc<dyn ResourceRetriever>,
  http: Arc<dyn ResourceRetriever>,
}

impl ResourceProvider {
  pub fn new(
    file: Arc<dyn ResourceRetriever>,
    http: Arc<dyn ResourceRetriever>,
  ) -> Self {
    Self { file, http }
  }

  pub fn for_url(
    &self,
    url: &Url,
  ) -> Result<&Arc<dyn ResourceRetriever>, AnyError> {
    match url.scheme() {
      "file" => Ok(&self.file),
      "http" | "https" => Ok(&self.http),
      scheme => anyhow::bail!("no retriever for scheme '{}'", scheme),
    }
  }

  pub fn file(&self) -> &Arc<dyn ResourceRetriever> {
    &self.file
  }

  pub fn http(&self) -> &Arc<dyn ResourceRetriever> {
    &self.http
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::errors::is_not_found;

  fn token() -> CancellationToken {
    CancellationToken::new()
  }

  #[tokio::test]
  async fn file_fetch_signals_not_found() {
    let dir = tempfile::TempDir::new().unwrap();
    let retriever = FileRetriever;
    let missing =
      Url::from_file_path(dir.path().join("missing.ts")).unwrap();
    let err = retriever.fetch(&missing, &token()).await.unwrap_err();
    assert!(is_not_found(&err));

    let present = dir.path().join("a.ts");
    std::fs::write(&present, "export {}").unwrap();
    let bytes = retriever
      .fetch(&Url::from_file_path(&present).unwrap(), &token())
      .await
      .unwrap();
    assert_eq!(bytes, b"export {}");
  }

  #[tokio::test]
  async fn file_fetch_respects_cancellation() {
    let retriever = FileRetriever;
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let url = Url::parse("file:///tmp/whatever.ts").unwrap();
    let err = retriever.fetch(&url, &cancelled).await.unwrap_err();
    assert!(crate::errors::is_cancelled(&err));
  }

  #[tokio::test]
  async fn glob_matches_under_root_and_prunes_ignored() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("node_modules/lodash/dist")).unwrap();
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::write(
      root.join("node_modules/lodash/dist/index.d.ts.map"),
      "{}",
    )
    .unwrap();
    std::fs::write(root.join("src/a.ts"), "").unwrap();

    let retriever = FileRetriever;
    let root_url = Url::from_directory_path(root).unwrap();
    let maps = retriever
      .glob(&root_url, "**/node_modules/lodash/**/*.d.ts.map", &[], &token())
      .await
      .unwrap();
    assert_eq!(maps.len(), 1);
    assert!(maps[0].as_str().ends_with("index.d.ts.map"));

    let pruned = retriever
      .glob(&root_url, "**/*.d.ts.map", &["node_modules"], &token())
      .await
      .unwrap();
    assert!(pruned.is_empty());
  }

  #[test]
  fn provider_dispatches_by_scheme() {
    let provider = ResourceProvider::new(
      Arc::new(FileRetriever),
      Arc::new(HttpRetriever::new(reqwest::Client::new(), None)),
    );
    assert!(provider
      .for_url(&Url::parse("file:///a").unwrap())
      .is_ok());
    assert!(provider
      .for_url(&Url::parse("https://h/a").unwrap())
      .is_ok());
    assert!(provider
      .for_url(&Url::parse("ftp://h/a").unwrap())
      .is_err());
  }
}
