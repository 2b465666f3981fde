// Copyright 2025 the ts-gateway authors. MIT license.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::check_cancelled;
use crate::errors::AnyError;
use crate::errors::ResourceNotFound;
use crate::package_json::PackageJson;

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org/";

/// Package names are a single path segment to the registry, so the
/// slash in scoped names must be encoded.
const PACKAGE_NAME: &percent_encoding::AsciiSet = &percent_encoding::CONTROLS
  .add(b' ')
  .add(b'"')
  .add(b'#')
  .add(b'%')
  .add(b'/')
  .add(b'<')
  .add(b'>')
  .add(b'?');

/// Package-registry metadata lookup. Answers are version documents
/// shaped like a published `package.json` (`types`, `typings`,
/// `repository`, `gitHead`).
#[async_trait]
pub trait NpmRegistryApi: Send + Sync {
  async fn package_info(
    &self,
    name: &str,
    version: Option<&str>,
    token: &CancellationToken,
  ) -> Result<Arc<PackageJson>, AnyError>;
}

/// Uncached metadata download, separated from the caching layer so
/// tests can count fetches.
#[async_trait]
pub trait RegistryInfoDownloader: Send + Sync {
  async fn download(
    &self,
    name: &str,
    version: Option<&str>,
  ) -> Result<PackageJson, AnyError>;
}

pub struct HttpRegistryInfoDownloader {
  client: reqwest::Client,
  base: Url,
}

impl HttpRegistryInfoDownloader {
  pub fn new(client: reqwest::Client, base: Url) -> Self {
    Self { client, base }
  }

  fn version_doc_url(
    &self,
    name: &str,
    version: Option<&str>,
  ) -> Result<Url, AnyError> {
    let encoded =
      percent_encoding::utf8_percent_encode(name, PACKAGE_NAME).to_string();
    Ok(
      self
        .base
        .join(&format!("{}/{}", encoded, version.unwrap_or("latest")))?,
    )
  }
}

#[async_trait]
impl RegistryInfoDownloader for HttpRegistryInfoDownloader {
  async fn download(
    &self,
    name: &str,
    version: Option<&str>,
  ) -> Result<PackageJson, AnyError> {
    let url = self.version_doc_url(name, version)?;
    let response = self.client.get(url.clone()).send().await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Err(ResourceNotFound(url).into());
    }
    let response = response.error_for_status()?;
    Ok(response.json::<PackageJson>().await?)
  }
}

type InfoResult = Result<Arc<PackageJson>, Arc<AnyError>>;

enum CacheItem {
  Pending(Shared<BoxFuture<'static, InfoResult>>),
  Resolved(InfoResult),
}

/// Session-scoped metadata cache. Concurrent lookups for the same
/// `name@version` collapse onto one download.
pub struct CachingNpmRegistryApi {
  downloader: Arc<dyn RegistryInfoDownloader>,
  mem_cache: Mutex<HashMap<String, CacheItem>>,
}

impl CachingNpmRegistryApi {
  pub fn new(downloader: Arc<dyn RegistryInfoDownloader>) -> Self {
    Self {
      downloader,
      mem_cache: Default::default(),
    }
  }
}

#[async_trait]
impl NpmRegistryApi for CachingNpmRegistryApi {
  async fn package_info(
    &self,
    name: &str,
    version: Option<&str>,
    token: &CancellationToken,
  ) -> Result<Arc<PackageJson>, AnyError> {
    check_cancelled(token)?;
    let key = format!("{}@{}", name, version.unwrap_or("latest"));
    let (future, owns_resolution) = {
      let mut mem_cache = self.mem_cache.lock();
      match mem_cache.get(&key) {
        Some(CacheItem::Resolved(result)) => {
          return clone_info_result(result);
        }
        Some(CacheItem::Pending(future)) => (future.clone(), false),
        None => {
          let downloader = self.downloader.clone();
          let name = name.to_string();
          let version = version.map(str::to_string);
          let future = async move {
            downloader
              .download(&name, version.as_deref())
              .await
              .map(Arc::new)
              .map_err(Arc::new)
          }
          .boxed()
          .shared();
          mem_cache.insert(key.clone(), CacheItem::Pending(future.clone()));
          (future, true)
        }
      }
    };
    let result = future.await;
    if owns_resolution {
      self
        .mem_cache
        .lock()
        .insert(key, CacheItem::Resolved(clone_info_result_raw(&result)));
    }
    clone_info_result(&result)
  }
}

fn clone_info_result_raw(result: &InfoResult) -> InfoResult {
  match result {
    Ok(info) => Ok(info.clone()),
    Err(err) => Err(err.clone()),
  }
}

fn clone_info_result(
  result: &InfoResult,
) -> Result<Arc<PackageJson>, AnyError> {
  match result {
    Ok(info) => Ok(info.clone()),
    Err(err) => Err(anyhow::anyhow!("{:#}", err)),
  }
}
