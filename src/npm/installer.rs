// Copyright 2025 the ts-gateway authors. MIT license.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::check_cancelled;
use crate::errors::is_cancelled;
use crate::errors::AnyError;
use crate::logging::lsp_debug;
use crate::logging::lsp_log;
use crate::logging::lsp_warn;
use crate::npm::registry::NpmRegistryApi;
use crate::package_json::PackageJson;
use crate::tsconfig::sanitize_tsconfigs_under;
use crate::tsserver::TsServerSupervisor;
use crate::urls::ensure_trailing_slash;
use crate::urls::WorkspaceUrls;

/// One installer invocation, isolated to per-manifest store and
/// cache directories so concurrent installations cannot interfere.
#[derive(Debug, Clone)]
pub struct InstallRequest {
  pub manifest_dir: PathBuf,
  pub cache_dir: PathBuf,
  pub global_dir: PathBuf,
  pub npmrc_path: Option<PathBuf>,
}

#[async_trait]
pub trait PackageInstaller: Send + Sync {
  async fn install(
    &self,
    request: &InstallRequest,
    token: &CancellationToken,
  ) -> Result<(), AnyError>;
}

/// Production installer: spawns `npm install` with scripts disabled.
/// Nothing from the materialized workspace may execute. The cache
/// lands in the per-manifest cache directory and the global space is
/// redirected to the per-manifest store, so concurrent installations
/// never share state.
#[derive(Debug, Default)]
pub struct NpmInstaller;

#[async_trait]
impl PackageInstaller for NpmInstaller {
  async fn install(
    &self,
    request: &InstallRequest,
    token: &CancellationToken,
  ) -> Result<(), AnyError> {
    check_cancelled(token)?;
    let mut command = tokio::process::Command::new("npm");
    command
      .arg("install")
      .arg("--ignore-scripts")
      .arg("--no-audit")
      .arg("--no-fund")
      .arg("--no-progress")
      .arg("--cache")
      .arg(&request.cache_dir)
      .env("npm_config_prefix", &request.global_dir)
      .current_dir(&request.manifest_dir)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    if let Some(npmrc_path) = &request.npmrc_path {
      command.arg("--userconfig").arg(npmrc_path);
    }
    let child = command.spawn()?;
    let output = tokio::select! {
      output = child.wait_with_output() => output?,
      _ = token.cancelled() => {
        return Err(crate::errors::Cancelled.into());
      }
    };
    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      anyhow::bail!(
        "installer exited with {}: {}",
        output.status,
        stderr.trim().lines().last().unwrap_or("")
      );
    }
    Ok(())
  }
}

pub struct FilterOutcome {
  pub removed: usize,
  pub remaining: usize,
}

/// Narrows a manifest to dependencies that carry type declarations:
/// `@types/*` unconditionally, anything else only when registry
/// metadata shows a `types` or `typings` field. Unreachable metadata
/// keeps the dependency.
pub async fn filter_typed_dependencies(
  manifest: &mut PackageJson,
  registry: &dyn NpmRegistryApi,
  token: &CancellationToken,
) -> Result<FilterOutcome, AnyError> {
  let mut removed = 0;
  for table in [&mut manifest.dependencies, &mut manifest.dev_dependencies] {
    let names: Vec<String> = table.keys().cloned().collect();
    for name in names {
      if name.starts_with("@types/") {
        continue;
      }
      match registry.package_info(&name, None, token).await {
        Ok(info) => {
          if !info.has_types() {
            table.shift_remove(&name);
            removed += 1;
          }
        }
        Err(err) if is_cancelled(&err) => return Err(err),
        Err(err) => {
          lsp_debug!(
            "Keeping dependency '{}', metadata unreachable: {:#}",
            name,
            err
          );
        }
      }
    }
  }
  Ok(FilterOutcome {
    removed,
    remaining: manifest.dependency_count(),
  })
}

type InstallResult = Result<(), Arc<AnyError>>;

enum InstallationState {
  InProgress(Shared<BoxFuture<'static, InstallResult>>),
  Finished(InstallResult),
}

struct CoordinatorInner {
  urls: Arc<WorkspaceUrls>,
  cache_root: PathBuf,
  global_root: PathBuf,
  npmrc_path: Option<PathBuf>,
  installer: Arc<dyn PackageInstaller>,
  registry: Arc<dyn NpmRegistryApi>,
  /// When present, restarted after a completed installation so the
  /// downstream notices new files under `node_modules/`.
  restart_supervisor: Option<Arc<TsServerSupervisor>>,
  session_token: CancellationToken,
}

/// Single-flight installation per manifest directory. The first call
/// for a directory runs the installation; every later or concurrent
/// call awaits the same outcome. A failed installation is terminal
/// and never retried, and failures are logged rather than surfaced
/// so a request that triggered a best-effort install still succeeds.
pub struct InstallationCoordinator {
  inner: Arc<CoordinatorInner>,
  states: Mutex<HashMap<Url, InstallationState>>,
}

impl InstallationCoordinator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    urls: Arc<WorkspaceUrls>,
    cache_root: PathBuf,
    global_root: PathBuf,
    npmrc_path: Option<PathBuf>,
    installer: Arc<dyn PackageInstaller>,
    registry: Arc<dyn NpmRegistryApi>,
    restart_supervisor: Option<Arc<TsServerSupervisor>>,
    session_token: CancellationToken,
  ) -> Self {
    Self {
      inner: Arc::new(CoordinatorInner {
        urls,
        cache_root,
        global_root,
        npmrc_path,
        installer,
        registry,
        restart_supervisor,
        session_token,
      }),
      states: Default::default(),
    }
  }

  /// Completes when the one installation attempt for `manifest_dir`
  /// has finished, whichever caller started it.
  pub async fn ensure_installed(&self, manifest_dir: &Url) {
    let manifest_dir = ensure_trailing_slash(manifest_dir.clone());
    let (future, owns_resolution) = {
      let mut states = self.states.lock();
      match states.get(&manifest_dir) {
        Some(InstallationState::Finished(_)) => return,
        Some(InstallationState::InProgress(future)) => {
          (future.clone(), false)
        }
        None => {
          let inner = self.inner.clone();
          let dir = manifest_dir.clone();
          let future = async move {
            inner.run_install(&dir).await.map_err(Arc::new)
          }
          .boxed()
          .shared();
          states.insert(
            manifest_dir.clone(),
            InstallationState::InProgress(future.clone()),
          );
          (future, true)
        }
      }
    };
    let result = future.await;
    if owns_resolution {
      if let Err(err) = &result {
        if is_cancelled(err) {
          lsp_debug!("Installation for '{}' cancelled", manifest_dir);
        } else {
          lsp_warn!("Installation for '{}' failed: {:#}", manifest_dir, err);
        }
      }
      self
        .states
        .lock()
        .insert(manifest_dir, InstallationState::Finished(result));
    }
  }
}

impl CoordinatorInner {
  async fn run_install(&self, manifest_dir: &Url) -> Result<(), AnyError> {
    let token = &self.session_token;
    check_cancelled(token)?;
    let file_dir = self.urls.http_to_file(manifest_dir)?;
    let dir_path = file_dir
      .to_file_path()
      .map_err(|_| anyhow::anyhow!("manifest outside filesystem"))?;
    let manifest_path = dir_path.join("package.json");
    let mut manifest =
      PackageJson::from_slice(&tokio::fs::read(&manifest_path).await?)?;

    let outcome =
      filter_typed_dependencies(&mut manifest, &*self.registry, token)
        .await?;
    if outcome.remaining == 0 {
      lsp_debug!(
        "No type-bearing dependencies declared at '{}'",
        manifest_dir
      );
      return Ok(());
    }
    if outcome.removed > 0 {
      tokio::fs::write(&manifest_path, manifest.to_pretty_string()?).await?;
    }

    let rel = manifest_dir
      .as_str()
      .strip_prefix(self.urls.http_root().as_str())
      .unwrap_or_default()
      .trim_matches('/');
    let request = InstallRequest {
      manifest_dir: dir_path.clone(),
      cache_dir: self.cache_root.join(rel),
      global_dir: self.global_root.join(rel),
      npmrc_path: self.npmrc_path.clone(),
    };
    tokio::fs::create_dir_all(&request.cache_dir).await?;
    tokio::fs::create_dir_all(&request.global_dir).await?;

    lsp_log!(
      "Installing type-bearing dependencies for '{}'",
      manifest_dir
    );
    self.installer.install(&request, token).await?;
    sanitize_tsconfigs_under(&dir_path.join("node_modules"));

    if let Some(supervisor) = &self.restart_supervisor {
      if let Err(err) = supervisor.restart(token).await {
        if err.downcast_ref::<crate::errors::FatalSpawnError>().is_some() {
          // Not recoverable within the session.
          self.session_token.cancel();
        }
        lsp_warn!("Restart after installation failed: {:#}", err);
      }
    }
    Ok(())
  }
}
