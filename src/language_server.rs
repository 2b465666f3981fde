// Copyright 2025 the ts-gateway authors. MIT license.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_lsp::jsonrpc;
use tower_lsp::lsp_types as lsp;
use tower_lsp::lsp_types::request::GotoImplementationParams;
use tower_lsp::lsp_types::request::GotoImplementationResponse;
use tower_lsp::lsp_types::request::GotoTypeDefinitionParams;
use tower_lsp::lsp_types::request::GotoTypeDefinitionResponse;
use tower_lsp::LanguageServer;
use url::Url;

use crate::archive;
use crate::client::Client;
use crate::client::ProgressReporter;
use crate::config::Settings;
use crate::errors::is_cancelled;
use crate::errors::mapping_error;
use crate::errors::validation_error;
use crate::errors::AnyError;
use crate::errors::DownstreamError;
use crate::errors::FatalSpawnError;
use crate::errors::ValidationError;
use crate::logging::lsp_log;
use crate::logging::lsp_warn;
use crate::manifests::ManifestRegistry;
use crate::npm::installer::InstallationCoordinator;
use crate::npm::installer::PackageInstaller;
use crate::npm::installer::NpmInstaller;
use crate::npm::registry::CachingNpmRegistryApi;
use crate::npm::registry::HttpRegistryInfoDownloader;
use crate::npm::registry::DEFAULT_REGISTRY_URL;
use crate::package_json::PackageJson;
use crate::resources::FileRetriever;
use crate::resources::HttpRetriever;
use crate::resources::ResourceProvider;
use crate::session::Session;
use crate::session::SessionDirs;
use crate::session::SessionState;
use crate::sourcemaps::find_package_root_and_name;
use crate::sourcemaps::SourceMapResolver;
use crate::sourcemaps::FAN_OUT_WIDTH;
use crate::tsconfig::sanitize_tsconfigs_under;
use crate::tsserver::language_id_for_path;
use crate::tsserver::spawn_diagnostics_forwarder;
use crate::tsserver::LanguageServiceSpawner;
use crate::tsserver::TsLanguageServiceSpawner;
use crate::tsserver::TsServerSupervisor;
use crate::urls;
use crate::urls::ensure_trailing_slash;
use crate::urls::find_node_modules_package;
use crate::urls::parse_external_url;
use crate::urls::WorkspaceUrls;
use crate::util::fs::find_files_named;
use crate::util::sync::spawn_logged;

/// Hover text that suggests the downstream could not resolve types,
/// used to kick off a background dependency installation.
static MISSING_TYPES_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"\b(any|import)\b").unwrap());

pub struct GatewayOptions {
  /// Parent of every per-session temp directory.
  pub temp_root: PathBuf,
  /// Overridable for tests; `None` spawns the production child
  /// process against the session cache directory.
  pub spawner: Option<Arc<dyn LanguageServiceSpawner>>,
  pub installer: Arc<dyn PackageInstaller>,
  pub http_client: reqwest::Client,
}

impl GatewayOptions {
  pub fn new(temp_root: PathBuf) -> Self {
    Self {
      temp_root,
      spawner: None,
      installer: Arc::new(NpmInstaller),
      http_client: reqwest::Client::new(),
    }
  }
}

/// The per-connection request router. Handlers run concurrently;
/// shared state lives behind the session.
pub struct GatewayServer {
  client: Client,
  session: Arc<Session>,
  options: GatewayOptions,
}

impl GatewayServer {
  pub fn new(client: tower_lsp::Client, options: GatewayOptions) -> Self {
    Self::with_client(Client::from_tower(client), options)
  }

  pub fn with_client(client: Client, options: GatewayOptions) -> Self {
    Self {
      client,
      session: Arc::new(Session::new()),
      options,
    }
  }

  pub fn session(&self) -> &Arc<Session> {
    &self.session
  }

  #[allow(deprecated)] // root_uri is how this protocol names roots
  async fn initialize_inner(
    &self,
    params: lsp::InitializeParams,
  ) -> Result<lsp::InitializeResult, AnyError> {
    let settings =
      Settings::from_initialization_options(params.initialization_options.as_ref());
    let http_root = validate_initialize_root(
      params.root_uri.as_ref(),
      params.workspace_folders.as_deref(),
    )?;
    let progress_supported = params
      .capabilities
      .window
      .as_ref()
      .and_then(|window| window.work_done_progress)
      .unwrap_or(false);
    self.session.set_settings(settings.clone());
    let token = self.session.request_token();

    let dirs = SessionDirs::create(
      &self.options.temp_root,
      self.session.id,
      settings.npmrc_contents().as_deref(),
    )?;
    {
      let root = dirs.root.clone();
      self.session.add_disposable(
        "temp-dir",
        Box::new(move || {
          Box::pin(async move {
            if let Err(err) = tokio::fs::remove_dir_all(&root).await {
              lsp_warn!("Could not remove '{}': {}", root.display(), err);
            }
          })
        }),
      );
    }

    let file_root = Url::from_directory_path(&dirs.repo)
      .map_err(|_| anyhow::anyhow!("session directory is not absolute"))?;
    let urls = Arc::new(WorkspaceUrls::new(http_root.clone(), file_root));
    let access_token = settings.typescript.access_token.clone();
    let resources = Arc::new(ResourceProvider::new(
      Arc::new(FileRetriever),
      Arc::new(HttpRetriever::new(
        self.options.http_client.clone(),
        access_token.clone(),
      )),
    ));

    let progress = ProgressReporter::begin(
      self.client.clone(),
      format!("ts-gateway/{}", self.session.id),
      "Initializing workspace",
      settings.typescript.progress && progress_supported,
    )
    .await;
    let materialized = match archive::fetch_workspace_archive(
      &http_root,
      &dirs.repo,
      &self.options.http_client,
      access_token.as_deref(),
      &progress,
      &token,
    )
    .await
    {
      Ok(materialized) => materialized,
      Err(err) => {
        progress.end(None).await;
        return Err(err);
      }
    };
    lsp_log!(
      "Materialized workspace for '{}' with {} manifest(s)",
      http_root,
      materialized.manifest_dirs.len()
    );
    let manifests =
      Arc::new(ManifestRegistry::build(materialized.manifest_dirs, &urls));
    sanitize_tsconfigs_under(&dirs.repo);

    let registry_base = settings
      .npm_registry_url()
      .and_then(|raw| Url::parse(raw).ok())
      .unwrap_or_else(|| Url::parse(DEFAULT_REGISTRY_URL).unwrap());
    let registry = Arc::new(CachingNpmRegistryApi::new(Arc::new(
      HttpRegistryInfoDownloader::new(
        self.options.http_client.clone(),
        registry_base,
      ),
    )));

    let spawner = self.options.spawner.clone().unwrap_or_else(|| {
      Arc::new(TsLanguageServiceSpawner {
        tsserver_cache_dir: dirs.tsserver_cache.clone(),
      })
    });
    let (supervisor, diagnostics_rx) = TsServerSupervisor::new(spawner);
    let forwarder = spawn_diagnostics_forwarder(
      diagnostics_rx,
      urls.clone(),
      self.client.clone(),
      settings.typescript.diagnostics.enable,
    );
    self.session.add_disposable(
      "diagnostics-forwarder",
      Box::new(move || {
        Box::pin(async move {
          forwarder.abort();
        })
      }),
    );
    {
      let supervisor = supervisor.clone();
      self.session.add_disposable(
        "language-service",
        Box::new(move || {
          Box::pin(async move {
            supervisor.dispose().await;
          })
        }),
      );
    }

    let installations = Arc::new(InstallationCoordinator::new(
      urls.clone(),
      dirs.cache.clone(),
      dirs.global.clone(),
      dirs.npmrc.clone(),
      self.options.installer.clone(),
      registry.clone(),
      settings
        .typescript
        .restart_after_dependency_installation
        .then(|| supervisor.clone()),
      self.session.token().clone(),
    ));
    let sourcemaps = Arc::new(SourceMapResolver::new(
      resources.clone(),
      Url::from_directory_path(&dirs.root)
        .map_err(|_| anyhow::anyhow!("session directory is not absolute"))?,
    ));

    let init_params = json!({
      "processId": Value::Null,
      "rootUri": urls.file_root(),
      "capabilities": {
        "textDocument": {
          "publishDiagnostics": { "relatedInformation": true }
        },
        "workspace": {}
      },
      "initializationOptions": { "hostInfo": "ts-gateway" },
      "workspaceFolders": [
        { "uri": urls.file_root(), "name": "workspace" }
      ],
    });
    let start_result = supervisor.start(init_params, &token).await;
    progress.end(None).await;
    let result_value = match start_result {
      Ok(value) => value,
      Err(err) => {
        if err.downcast_ref::<FatalSpawnError>().is_some() {
          lsp_warn!("Language service could not start, closing session");
          self
            .client
            .show_message(lsp::MessageType::ERROR, &err)
            .await;
          self.session.dispose().await;
        }
        return Err(err);
      }
    };

    self.session.set_state(SessionState {
      urls,
      dirs,
      resources,
      manifests,
      registry,
      installations,
      supervisor,
      sourcemaps,
    })?;

    let mut result: lsp::InitializeResult =
      serde_json::from_value(result_value).unwrap_or_default();
    result.server_info = Some(lsp::ServerInfo {
      name: "ts-gateway".to_string(),
      version: Some(env!("CARGO_PKG_VERSION").to_string()),
    });
    Ok(result)
  }

  /// Incoming text-document mapping. In-workspace URLs rewrite
  /// directly; everything else is a cross-repository reference that
  /// resolves through installed dependencies.
  async fn map_text_document_position(
    &self,
    uri: &Url,
    position: lsp::Position,
    token: &CancellationToken,
  ) -> Result<(Url, lsp::Position), AnyError> {
    let state = self.session.state()?;
    if state.urls.contains_http(uri) {
      return Ok((state.urls.http_to_file(uri)?, position));
    }

    let external = parse_external_url(uri)
      .ok_or_else(|| mapping_error(format!("unrecognized URL: {}", uri)))?;
    let raw_root = external_raw_root(uri)?;
    let Some((package_name, package_rel_path)) = find_package_root_and_name(
      &raw_root,
      &external.path,
      &**state.resources.http(),
      token,
    )
    .await?
    else {
      return Err(mapping_error(format!(
        "could not determine the package at '{}'",
        uri
      )));
    };

    // Install (and warm up) every manifest that declares the
    // package, in parallel, before asking the declaration maps.
    let manifest_dirs: Vec<Url> = state
      .manifests
      .declared_in(&package_name)
      .into_iter()
      .map(|entry| entry.dir.clone())
      .collect();
    let preparations = manifest_dirs.into_iter().map(|dir| {
      let installations = state.installations.clone();
      let token = token.clone();
      async move {
        installations.ensure_installed(&dir).await;
        if let Err(err) = self.warm_up_projects(&dir, &token).await {
          if !is_cancelled(&err) {
            lsp_warn!("Project warmup for '{}' failed: {:#}", dir, err);
          }
        }
      }
    });
    futures::future::join_all(preparations).await;

    match state
      .sourcemaps
      .resolve_incoming_position(&package_name, &package_rel_path, position, token)
      .await?
    {
      Some(resolved) => Ok(resolved),
      None => Err(mapping_error(format!(
        "could not locate '{}' of package '{}' in this workspace",
        package_rel_path, package_name
      ))),
    }
  }

  /// Best-effort project warmup: open one module per `tsconfig.json`
  /// reachable from the manifest directory so the downstream loads
  /// those projects.
  async fn warm_up_projects(
    &self,
    manifest_dir: &Url,
    token: &CancellationToken,
  ) -> Result<(), AnyError> {
    let state = self.session.state()?;
    let file_dir = state.urls.http_to_file(manifest_dir)?;
    let dir_path = file_dir
      .to_file_path()
      .map_err(|_| anyhow::anyhow!("manifest outside filesystem"))?;
    let repo_root = state.dirs.repo.clone();

    let mut project_dirs = Vec::new();
    for ancestor in dir_path.ancestors() {
      if ancestor.join("tsconfig.json").is_file() {
        project_dirs.push(ancestor.to_path_buf());
      }
      if ancestor == repo_root {
        break;
      }
    }
    for tsconfig in
      find_files_named(&dir_path, "tsconfig.json", &["node_modules"])
    {
      if let Some(parent) = tsconfig.parent() {
        let parent = parent.to_path_buf();
        if !project_dirs.contains(&parent) {
          project_dirs.push(parent);
        }
      }
    }

    let mut openings = futures::stream::iter(project_dirs.into_iter().map(
      |project_dir| {
        let token = token.clone();
        async move {
          let Some(module) = first_module_in(&project_dir) else {
            return Ok(());
          };
          let Ok(file_url) = Url::from_file_path(&module) else {
            return Ok(());
          };
          self.ensure_document_open(&file_url, &token).await
        }
      },
    ))
    .buffer_unordered(FAN_OUT_WIDTH);
    while let Some(result) = openings.next().await {
      if let Err(err) = result {
        if is_cancelled(&err) {
          return Err(err);
        }
        lsp_warn!("Could not open a warmup module: {:#}", err);
      }
    }
    Ok(())
  }

  /// Announces a workspace file downstream exactly once, reading its
  /// text off disk.
  async fn ensure_document_open(
    &self,
    file_url: &Url,
    token: &CancellationToken,
  ) -> Result<(), AnyError> {
    let state = self.session.state()?;
    if state.supervisor.is_open(file_url) {
      return Ok(());
    }
    let retriever = state.resources.for_url(file_url)?;
    let bytes = retriever.fetch(file_url, token).await?;
    let item = lsp::TextDocumentItem {
      uri: file_url.clone(),
      language_id: language_id_for_path(file_url.path()).to_string(),
      version: 0,
      text: String::from_utf8_lossy(&bytes).into_owned(),
    };
    state.supervisor.ensure_open(item).await
  }

  /// Outgoing location mapping for definition-family results.
  async fn map_location_out(
    &self,
    location: lsp::Location,
    token: &CancellationToken,
  ) -> Option<lsp::Location> {
    let state = self.session.state().ok()?;
    let settings = self.session.settings();
    let instance = instance_url(&settings);
    let access_token = settings.typescript.access_token.as_deref();

    if let Some(rel) = urls::typescript_lib_path(&state.urls, &location.uri) {
      return match urls::typescript_lib_url(&rel, &instance, access_token) {
        Ok(uri) => Some(lsp::Location {
          uri,
          range: location.range,
        }),
        Err(err) => {
          lsp_warn!("Dropping location: {:#}", err);
          None
        }
      };
    }

    let in_node_modules = location
      .uri
      .path()
      .split('/')
      .any(|segment| segment == "node_modules");
    if !in_node_modules {
      return match state.urls.file_to_http(&location.uri) {
        Ok(uri) => Some(lsp::Location {
          uri,
          range: location.range,
        }),
        Err(err) => {
          lsp_warn!("Dropping location: {:#}", err);
          None
        }
      };
    }

    // Prefer the original source over the declaration file when a
    // sibling map resolves it; either way the result points into the
    // owning package's repository.
    let mapped = state
      .sourcemaps
      .map_declaration_location(&location, token)
      .await;
    match self
      .resolve_dependency_location(&location, mapped.as_ref(), token)
      .await
    {
      Ok(location) => Some(location),
      Err(err) => {
        lsp_warn!("Dropping dependency location: {:#}", err);
        None
      }
    }
  }

  async fn resolve_dependency_location(
    &self,
    declaration: &lsp::Location,
    mapped: Option<&lsp::Location>,
    token: &CancellationToken,
  ) -> Result<lsp::Location, AnyError> {
    let state = self.session.state()?;
    let settings = self.session.settings();
    let found =
      find_node_modules_package(&declaration.uri).ok_or_else(|| {
        mapping_error(format!(
          "not a dependency path: {}",
          declaration.uri
        ))
      })?;
    let manifest_url = found.package_root.join("package.json")?;
    let manifest = PackageJson::from_slice(
      &state.resources.file().fetch(&manifest_url, token).await?,
    )?;
    let package_name =
      manifest.name.clone().unwrap_or_else(|| found.name.clone());

    // Registry metadata carries the published commit; the installed
    // manifest is the fallback when the registry is unreachable.
    let meta = match state
      .registry
      .package_info(&package_name, manifest.version.as_deref(), token)
      .await
    {
      Ok(info) => info,
      Err(err) => {
        if is_cancelled(&err) {
          return Err(err);
        }
        Arc::new(manifest.clone())
      }
    };
    let repo = urls::package_repo(&meta, &package_name)
      .or_else(|_| urls::package_repo(&manifest, &package_name))?;

    let target = mapped.unwrap_or(declaration);
    let path = external_path_for(
      &repo,
      &found.package_root,
      state.urls.file_root(),
      &target.uri,
    )
    .ok_or_else(|| {
      mapping_error(format!(
        "'{}' resolves outside the workspace",
        target.uri
      ))
    })?;
    let uri = urls::build_external_url(
      &instance_url(&settings),
      &urls::ExternalRepoRef {
        repo_name: repo.repo_name,
        revision: repo.revision,
        path,
      },
      settings.typescript.access_token.as_deref(),
    )?;
    Ok(lsp::Location {
      uri,
      range: target.range,
    })
  }

  async fn map_locations_out(
    &self,
    locations: Vec<lsp::Location>,
    token: &CancellationToken,
  ) -> Vec<lsp::Location> {
    let mut mapped = Vec::with_capacity(locations.len());
    for location in locations {
      if let Some(location) = self.map_location_out(location, token).await {
        mapped.push(location);
      }
    }
    mapped
  }

  async fn hover_inner(
    &self,
    params: lsp::HoverParams,
  ) -> Result<Option<lsp::Hover>, AnyError> {
    let token = self.session.request_token();
    let doc_uri = params
      .text_document_position_params
      .text_document
      .uri
      .clone();
    let (file_url, position) = self
      .map_text_document_position(
        &doc_uri,
        params.text_document_position_params.position,
        &token,
      )
      .await?;
    let state = self.session.state()?;
    let response = state
      .supervisor
      .forward(
        "textDocument/hover",
        json!({
          "textDocument": { "uri": file_url },
          "position": position,
        }),
        &token,
      )
      .await?;
    let hover: Option<lsp::Hover> = match response {
      Value::Null => None,
      value => serde_json::from_value(value)?,
    };

    if let Some(hover) = &hover {
      if hover_hints_missing_types(hover) {
        // Best-effort enrichment; the client is expected to re-poll
        // once the installation lands.
        let session = self.session.clone();
        spawn_logged("hover-triggered install", async move {
          ensure_dependencies_for_document(&session, &doc_uri).await
        });
      }
    }
    Ok(hover)
  }

  async fn goto_inner(
    &self,
    method: &str,
    position_params: lsp::TextDocumentPositionParams,
  ) -> Result<Option<lsp::GotoDefinitionResponse>, AnyError> {
    let token = self.session.request_token();
    let (file_url, position) = self
      .map_text_document_position(
        &position_params.text_document.uri,
        position_params.position,
        &token,
      )
      .await?;
    self.ensure_document_open(&file_url, &token).await?;
    let state = self.session.state()?;
    let request = json!({
      "textDocument": { "uri": file_url },
      "position": position,
    });
    let response = state.supervisor.forward(method, request, &token).await?;
    let response: Option<lsp::GotoDefinitionResponse> = match response {
      Value::Null => None,
      value => serde_json::from_value(value)?,
    };
    let Some(response) = response else {
      return Ok(None);
    };

    let locations = match response {
      lsp::GotoDefinitionResponse::Scalar(location) => vec![location],
      lsp::GotoDefinitionResponse::Array(locations) => locations,
      lsp::GotoDefinitionResponse::Link(links) => links
        .into_iter()
        .map(|link| lsp::Location {
          uri: link.target_uri,
          range: link.target_selection_range,
        })
        .collect(),
    };
    let mapped = self.map_locations_out(locations, &token).await;
    Ok(Some(lsp::GotoDefinitionResponse::Array(mapped)))
  }

  async fn references_inner(
    &self,
    params: lsp::ReferenceParams,
  ) -> Result<Option<Vec<lsp::Location>>, AnyError> {
    let token = self.session.request_token();
    let (file_url, position) = self
      .map_text_document_position(
        &params.text_document_position.text_document.uri,
        params.text_document_position.position,
        &token,
      )
      .await?;
    self.ensure_document_open(&file_url, &token).await?;
    let state = self.session.state()?;
    let response = state
      .supervisor
      .forward(
        "textDocument/references",
        json!({
          "textDocument": { "uri": file_url },
          "position": position,
          "context": params.context,
        }),
        &token,
      )
      .await?;
    let locations: Option<Vec<lsp::Location>> = match response {
      Value::Null => None,
      value => serde_json::from_value(value)?,
    };
    match locations {
      Some(locations) => {
        Ok(Some(self.map_locations_out(locations, &token).await))
      }
      None => Ok(None),
    }
  }

  async fn code_action_inner(
    &self,
    params: lsp::CodeActionParams,
  ) -> Result<Option<lsp::CodeActionResponse>, AnyError> {
    let token = self.session.request_token();
    let state = self.session.state()?;
    let file_url = state.urls.http_to_file(&params.text_document.uri)?;
    self.ensure_document_open(&file_url, &token).await?;
    let response = state
      .supervisor
      .forward(
        "textDocument/codeAction",
        json!({
          "textDocument": { "uri": file_url },
          "range": params.range,
          "context": params.context,
        }),
        &token,
      )
      .await?;
    match response {
      Value::Null => Ok(None),
      value => Ok(serde_json::from_value(value)?),
    }
  }

  async fn did_open_inner(
    &self,
    params: lsp::DidOpenTextDocumentParams,
  ) -> Result<(), AnyError> {
    let state = self.session.state()?;
    let file_url = state.urls.http_to_file(&params.text_document.uri)?;
    state
      .supervisor
      .did_open(lsp::TextDocumentItem {
        uri: file_url,
        language_id: params.text_document.language_id,
        version: params.text_document.version,
        text: params.text_document.text,
      })
      .await
  }
}

/// Installs dependencies for every manifest that is a path parent of
/// the document.
async fn ensure_dependencies_for_document(
  session: &Arc<Session>,
  doc_uri: &Url,
) -> Result<(), AnyError> {
  let state = session.state()?;
  let dirs: Vec<Url> = state
    .manifests
    .parents_of(doc_uri)
    .into_iter()
    .map(|entry| entry.dir.clone())
    .collect();
  let installs = dirs.into_iter().map(|dir| {
    let installations = state.installations.clone();
    async move { installations.ensure_installed(&dir).await }
  });
  futures::future::join_all(installs).await;
  Ok(())
}

/// The in-repository path of a mapped dependency location. Sources
/// inside the package compose with the package's subdirectory;
/// declaration maps that climb out of the package (a package built
/// from its repository root) yield paths relative to the extraction
/// root, which already are repository paths.
fn external_path_for(
  repo: &urls::PackageRepo,
  package_root: &Url,
  file_root: &Url,
  target: &Url,
) -> Option<String> {
  if let Some(rel) = target.as_str().strip_prefix(package_root.as_str()) {
    return Some(match &repo.subdir {
      Some(subdir) => format!("{}/{}", subdir.trim_matches('/'), rel),
      None => rel.to_string(),
    });
  }
  target
    .as_str()
    .strip_prefix(file_root.as_str())
    .map(str::to_string)
}

fn instance_url(settings: &Settings) -> Url {
  settings
    .typescript
    .sourcegraph_url
    .as_deref()
    .and_then(|raw| Url::parse(raw).ok())
    .unwrap_or_else(|| Url::parse(urls::DEFAULT_INSTANCE_URL).unwrap())
}

/// The archive root of the repository an external URL points into:
/// everything up to and including `/-/raw/`.
fn external_raw_root(uri: &Url) -> Result<Url, AnyError> {
  let raw = uri.as_str();
  let idx = raw
    .find("/-/raw/")
    .ok_or_else(|| mapping_error(format!("unrecognized URL: {}", uri)))?;
  Ok(Url::parse(&raw[..idx + "/-/raw/".len()])?)
}

fn validate_initialize_root(
  root_uri: Option<&Url>,
  workspace_folders: Option<&[lsp::WorkspaceFolder]>,
) -> Result<Url, AnyError> {
  if workspace_folders.map(|folders| folders.len()).unwrap_or(0) > 1 {
    return Err(validation_error(
      "at most one workspace folder is supported".to_string(),
    ));
  }
  let root = root_uri
    .cloned()
    .or_else(|| {
      workspace_folders
        .and_then(|folders| folders.first())
        .map(|folder| folder.uri.clone())
    })
    .ok_or_else(|| validation_error("rootUri is required".to_string()))?;
  if !matches!(root.scheme(), "http" | "https") {
    return Err(validation_error(format!(
      "rootUri must be http(s), got '{}'",
      root.scheme()
    )));
  }
  Ok(ensure_trailing_slash(root))
}

fn hover_hints_missing_types(hover: &lsp::Hover) -> bool {
  serde_json::to_string(&hover.contents)
    .map(|text| MISSING_TYPES_RE.is_match(&text))
    .unwrap_or(false)
}

fn lsp_error(err: AnyError) -> jsonrpc::Error {
  let mut error = jsonrpc::Error::internal_error();
  if is_cancelled(&err) {
    error.code = jsonrpc::ErrorCode::ServerError(-32800);
    error.message = "request cancelled".into();
  } else if let Some(validation) = err.downcast_ref::<ValidationError>() {
    return jsonrpc::Error::invalid_params(validation.0.clone());
  } else if let Some(downstream) = err.downcast_ref::<DownstreamError>() {
    error.message = downstream.message.clone().into();
    error.data = downstream.data.clone();
  } else {
    error.message = format!("{:#}", err).into();
  }
  error
}

fn lsp_result<T>(result: Result<T, AnyError>) -> jsonrpc::Result<T> {
  result.map_err(lsp_error)
}

#[tower_lsp::async_trait]
impl LanguageServer for GatewayServer {
  async fn initialize(
    &self,
    params: lsp::InitializeParams,
  ) -> jsonrpc::Result<lsp::InitializeResult> {
    lsp_result(self.initialize_inner(params).await)
  }

  async fn initialized(&self, _params: lsp::InitializedParams) {
    lsp_log!("Session {} ready", self.session.id);
  }

  async fn shutdown(&self) -> jsonrpc::Result<()> {
    self.session.dispose().await;
    Ok(())
  }

  async fn did_open(&self, params: lsp::DidOpenTextDocumentParams) {
    if let Err(err) = self.did_open_inner(params).await {
      lsp_warn!("didOpen failed: {:#}", err);
    }
  }

  async fn hover(
    &self,
    params: lsp::HoverParams,
  ) -> jsonrpc::Result<Option<lsp::Hover>> {
    lsp_result(self.hover_inner(params).await)
  }

  async fn goto_definition(
    &self,
    params: lsp::GotoDefinitionParams,
  ) -> jsonrpc::Result<Option<lsp::GotoDefinitionResponse>> {
    lsp_result(
      self
        .goto_inner(
          "textDocument/definition",
          params.text_document_position_params,
        )
        .await,
    )
  }

  async fn goto_type_definition(
    &self,
    params: GotoTypeDefinitionParams,
  ) -> jsonrpc::Result<Option<GotoTypeDefinitionResponse>> {
    lsp_result(
      self
        .goto_inner(
          "textDocument/typeDefinition",
          params.text_document_position_params,
        )
        .await,
    )
  }

  async fn goto_implementation(
    &self,
    params: GotoImplementationParams,
  ) -> jsonrpc::Result<Option<GotoImplementationResponse>> {
    lsp_result(
      self
        .goto_inner(
          "textDocument/implementation",
          params.text_document_position_params,
        )
        .await,
    )
  }

  async fn references(
    &self,
    params: lsp::ReferenceParams,
  ) -> jsonrpc::Result<Option<Vec<lsp::Location>>> {
    lsp_result(self.references_inner(params).await)
  }

  async fn code_action(
    &self,
    params: lsp::CodeActionParams,
  ) -> jsonrpc::Result<Option<lsp::CodeActionResponse>> {
    lsp_result(self.code_action_inner(params).await)
  }
}

fn first_module_in(project_dir: &std::path::Path) -> Option<PathBuf> {
  let walker = walkdir::WalkDir::new(project_dir)
    .sort_by_file_name()
    .into_iter();
  let ignored = |entry: &walkdir::DirEntry| {
    entry.file_type().is_dir()
      && entry
        .file_name()
        .to_str()
        .map(|name| name == "node_modules")
        .unwrap_or(false)
  };
  for entry in walker.filter_entry(|e| !ignored(e)).flatten() {
    if !entry.file_type().is_file() {
      continue;
    }
    let Some(name) = entry.file_name().to_str() else {
      continue;
    };
    if name.ends_with(".ts") || name.ends_with(".tsx") {
      return Some(entry.into_path());
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn initialize_root_must_be_http() {
    let file_root = Url::parse("file:///repo/").unwrap();
    let err =
      validate_initialize_root(Some(&file_root), None).unwrap_err();
    assert!(err.downcast_ref::<ValidationError>().is_some());

    let http_root = Url::parse("https://h/repo@abc/-/raw").unwrap();
    let validated =
      validate_initialize_root(Some(&http_root), None).unwrap();
    assert_eq!(validated.as_str(), "https://h/repo@abc/-/raw/");
  }

  #[test]
  fn initialize_rejects_multiple_workspace_folders() {
    let folder = |uri: &str| lsp::WorkspaceFolder {
      uri: Url::parse(uri).unwrap(),
      name: "f".to_string(),
    };
    let folders = vec![
      folder("https://h/a@x/-/raw/"),
      folder("https://h/b@y/-/raw/"),
    ];
    let err = validate_initialize_root(None, Some(&folders)).unwrap_err();
    assert!(err.downcast_ref::<ValidationError>().is_some());

    let single = vec![folder("https://h/a@x/-/raw/")];
    let validated = validate_initialize_root(None, Some(&single)).unwrap();
    assert_eq!(validated.as_str(), "https://h/a@x/-/raw/");
  }

  #[test]
  fn initialize_requires_a_root() {
    let err = validate_initialize_root(None, None).unwrap_err();
    assert!(err.downcast_ref::<ValidationError>().is_some());
  }

  #[test]
  fn hover_heuristic_matches_whole_words_only() {
    let hover = |text: &str| lsp::Hover {
      contents: lsp::HoverContents::Scalar(lsp::MarkedString::String(
        text.to_string(),
      )),
      range: None,
    };
    assert!(hover_hints_missing_types(&hover("const x: any")));
    assert!(hover_hints_missing_types(&hover("import(\"lodash\")")));
    assert!(!hover_hints_missing_types(&hover("const x: anything")));
    assert!(!hover_hints_missing_types(&hover("const x: string")));
  }

  #[test]
  fn external_raw_root_truncates_after_the_marker() {
    let uri =
      Url::parse("https://h/other-repo@def/-/raw/src/x.ts").unwrap();
    assert_eq!(
      external_raw_root(&uri).unwrap().as_str(),
      "https://h/other-repo@def/-/raw/"
    );
    assert!(external_raw_root(&Url::parse("https://h/x.ts").unwrap())
      .is_err());
  }

  #[test]
  fn cancelled_errors_map_to_the_cancellation_code() {
    let error = lsp_error(crate::errors::Cancelled.into());
    assert_eq!(error.code, jsonrpc::ErrorCode::ServerError(-32800));

    let error = lsp_error(validation_error("bad root".to_string()));
    assert_eq!(error.code, jsonrpc::ErrorCode::InvalidParams);

    let error = lsp_error(
      DownstreamError {
        code: -32603,
        message: "tsserver exploded".to_string(),
        data: None,
      }
      .into(),
    );
    assert_eq!(error.message, "tsserver exploded");
  }

  #[test]
  fn dependency_paths_compose_with_the_package_repository() {
    let package_root =
      Url::parse("file:///tmp/s/repo/node_modules/lodash/").unwrap();
    let file_root = Url::parse("file:///tmp/s/repo/").unwrap();
    let repo = urls::PackageRepo {
      repo_name: "github.com/lodash/lodash".to_string(),
      revision: Some("abc".to_string()),
      subdir: None,
    };
    let path = |target: &str| {
      external_path_for(
        &repo,
        &package_root,
        &file_root,
        &Url::parse(target).unwrap(),
      )
    };
    // A declaration file inside the package.
    assert_eq!(
      path("file:///tmp/s/repo/node_modules/lodash/fp.d.ts").as_deref(),
      Some("fp.d.ts")
    );
    // A declaration map that climbed to the extraction root: the
    // relative path there already is the repository path.
    assert_eq!(
      path("file:///tmp/s/repo/src/index.ts").as_deref(),
      Some("src/index.ts")
    );
    assert_eq!(path("file:///elsewhere/x.ts"), None);

    let definitely_typed = urls::PackageRepo {
      subdir: Some("types/lodash".to_string()),
      ..repo
    };
    assert_eq!(
      external_path_for(
        &definitely_typed,
        &package_root,
        &file_root,
        &Url::parse("file:///tmp/s/repo/node_modules/lodash/fp.d.ts")
          .unwrap(),
      )
      .as_deref(),
      Some("types/lodash/fp.d.ts")
    );
  }

  #[test]
  fn first_module_prefers_sorted_paths_and_skips_node_modules() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("node_modules/x/a.ts"), "").unwrap();
    std::fs::write(dir.path().join("src/main.ts"), "").unwrap();
    std::fs::write(dir.path().join("zz.tsx"), "").unwrap();
    let module = first_module_in(dir.path()).unwrap();
    assert_eq!(module, dir.path().join("src/main.ts"));
  }
}
