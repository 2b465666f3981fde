// Copyright 2025 the ts-gateway authors. MIT license.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::errors::AnyError;
use crate::logging::lsp_debug;
use crate::manifests::ManifestRegistry;
use crate::npm::installer::InstallationCoordinator;
use crate::npm::registry::NpmRegistryApi;
use crate::resources::ResourceProvider;
use crate::sourcemaps::SourceMapResolver;
use crate::tsserver::TsServerSupervisor;
use crate::urls::WorkspaceUrls;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Filesystem layout under the per-session temp directory.
#[derive(Debug, Clone)]
pub struct SessionDirs {
  pub root: PathBuf,
  /// Workspace extraction target.
  pub repo: PathBuf,
  /// Per-manifest installer cache isolation.
  pub cache: PathBuf,
  /// Per-manifest installer store isolation.
  pub global: PathBuf,
  pub tsserver_cache: PathBuf,
  pub npmrc: Option<PathBuf>,
}

impl SessionDirs {
  pub fn create(
    temp_root: &Path,
    session_id: u64,
    npmrc_contents: Option<&str>,
  ) -> Result<Self, AnyError> {
    let root = temp_root.join(format!("session-{}", session_id));
    let dirs = Self {
      repo: root.join("repo"),
      cache: root.join("cache"),
      global: root.join("global"),
      tsserver_cache: root.join("tsserver_cache"),
      npmrc: npmrc_contents.map(|_| root.join(".npmrc")),
      root,
    };
    for dir in [&dirs.repo, &dirs.cache, &dirs.global, &dirs.tsserver_cache] {
      std::fs::create_dir_all(dir)?;
    }
    if let (Some(path), Some(contents)) = (&dirs.npmrc, npmrc_contents) {
      std::fs::write(path, contents)?;
    }
    Ok(dirs)
  }
}

/// Everything a ready session owns, built by the one Initialize.
pub struct SessionState {
  pub urls: Arc<WorkspaceUrls>,
  pub dirs: SessionDirs,
  pub resources: Arc<ResourceProvider>,
  pub manifests: Arc<ManifestRegistry>,
  pub registry: Arc<dyn NpmRegistryApi>,
  pub installations: Arc<InstallationCoordinator>,
  pub supervisor: Arc<TsServerSupervisor>,
  pub sourcemaps: Arc<SourceMapResolver>,
}

type Disposer = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// One per client connection. Created on connection open; destroyed
/// on close, running disposables in reverse insertion order with the
/// temp directory last.
pub struct Session {
  pub id: u64,
  token: CancellationToken,
  settings: RwLock<Arc<Settings>>,
  state: OnceCell<SessionState>,
  disposables: Mutex<Vec<(&'static str, Disposer)>>,
}

impl Session {
  pub fn new() -> Self {
    Self {
      id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
      token: CancellationToken::new(),
      settings: RwLock::new(Arc::new(Settings::default())),
      state: OnceCell::new(),
      disposables: Mutex::new(Vec::new()),
    }
  }

  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  /// A fresh per-request token. Cancelling the session cancels every
  /// outstanding request.
  pub fn request_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn settings(&self) -> Arc<Settings> {
    self.settings.read().clone()
  }

  pub fn set_settings(&self, settings: Settings) {
    *self.settings.write() = Arc::new(settings);
  }

  pub fn set_state(&self, state: SessionState) -> Result<(), AnyError> {
    self
      .state
      .set(state)
      .map_err(|_| anyhow::anyhow!("session already initialized"))
  }

  pub fn state(&self) -> Result<&SessionState, AnyError> {
    self
      .state
      .get()
      .ok_or_else(|| anyhow::anyhow!("session is not initialized"))
  }

  pub fn is_initialized(&self) -> bool {
    self.state.get().is_some()
  }

  pub fn add_disposable(&self, name: &'static str, disposer: Disposer) {
    self.disposables.lock().push((name, disposer));
  }

  /// Cancels everything in flight, then runs disposables in reverse
  /// insertion order, awaiting each.
  pub async fn dispose(&self) {
    self.token.cancel();
    let disposables: Vec<(&'static str, Disposer)> =
      self.disposables.lock().drain(..).rev().collect();
    for (name, disposer) in disposables {
      lsp_debug!("Disposing '{}'", name);
      disposer().await;
    }
  }
}

impl Default for Session {
  fn default() -> Self {
    Self::new()
  }
}
