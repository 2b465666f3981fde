// Copyright 2025 the ts-gateway authors. MIT license.

use url::Url;

use crate::errors::mapping_error;
use crate::errors::AnyError;
use crate::logging::lsp_warn;
use crate::package_json::PackageJson;

/// Version of the TypeScript compiler bundled with the downstream
/// language service. Locations inside its `lib/` directory are pinned
/// to this tag when rewritten to the upstream repository.
pub const TYPESCRIPT_VERSION: &str = "5.5.4";

pub const TYPESCRIPT_REPO: &str = "github.com/microsoft/TypeScript";

pub const DEFAULT_INSTANCE_URL: &str = "https://sourcegraph.com/";

/// Appends a trailing slash so that `Url::join` treats the URL as a
/// directory. Relative resolution under a slash-less root would drop
/// the final path segment.
pub fn ensure_trailing_slash(mut url: Url) -> Url {
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  url
}

/// The `(httpRoot, fileRoot)` pair under which all in-workspace URIs
/// resolve. Comparisons are textual on the normalized `href` form.
#[derive(Debug, Clone)]
pub struct WorkspaceUrls {
  http_root: Url,
  file_root: Url,
}

impl WorkspaceUrls {
  pub fn new(http_root: Url, file_root: Url) -> Self {
    Self {
      http_root: ensure_trailing_slash(http_root),
      file_root: ensure_trailing_slash(file_root),
    }
  }

  pub fn http_root(&self) -> &Url {
    &self.http_root
  }

  pub fn file_root(&self) -> &Url {
    &self.file_root
  }

  pub fn contains_http(&self, url: &Url) -> bool {
    url.as_str().starts_with(self.http_root.as_str())
  }

  pub fn contains_file(&self, url: &Url) -> bool {
    url.as_str().starts_with(self.file_root.as_str())
  }

  /// Rewrites an in-workspace HTTP URL to its file counterpart. The
  /// result is required to stay under the file root, which rejects
  /// path traversal in the input (`..` segments survive parsing in
  /// percent-encoded form and are collapsed by `join`).
  pub fn http_to_file(&self, url: &Url) -> Result<Url, AnyError> {
    let rel = url.as_str().strip_prefix(self.http_root.as_str()).ok_or_else(
      || mapping_error(format!("URL is outside the workspace: {}", url)),
    )?;
    let joined = self
      .file_root
      .join(rel)
      .map_err(|err| mapping_error(format!("invalid path '{}': {}", rel, err)))?;
    if !self.contains_file(&joined) {
      return Err(mapping_error(format!(
        "path escapes the workspace root: {}",
        url
      )));
    }
    Ok(joined)
  }

  /// Rewrites an in-workspace file URL to its public HTTP
  /// counterpart. Paths under `node_modules/` must never surface as
  /// in-workspace HTTP URLs; those are mapped to external-repo URLs
  /// instead.
  pub fn file_to_http(&self, url: &Url) -> Result<Url, AnyError> {
    let rel = url.as_str().strip_prefix(self.file_root.as_str()).ok_or_else(
      || mapping_error(format!("URL is outside the workspace: {}", url)),
    )?;
    if rel.split('/').any(|segment| segment == "node_modules") {
      return Err(mapping_error(format!(
        "refusing to expose a dependency path as a workspace URL: {}",
        url
      )));
    }
    let joined = self
      .http_root
      .join(rel)
      .map_err(|err| mapping_error(format!("invalid path '{}': {}", rel, err)))?;
    if !self.contains_http(&joined) {
      return Err(mapping_error(format!(
        "path escapes the workspace root: {}",
        url
      )));
    }
    Ok(joined)
  }
}

/// A reference into a repository other than the current workspace:
/// `<instance>/<repoName>[@<revision>]/-/raw/<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRepoRef {
  pub repo_name: String,
  pub revision: Option<String>,
  pub path: String,
}

pub fn parse_external_url(url: &Url) -> Option<ExternalRepoRef> {
  let path = url.path();
  let (repo_part, file_part) = match path.split_once("/-/raw/") {
    Some((repo, file)) => (repo, file),
    None => (path.strip_suffix("/-/raw")?, ""),
  };
  let repo_part = repo_part.trim_start_matches('/');
  if repo_part.is_empty() {
    return None;
  }
  let (repo_name, revision) = match repo_part.rsplit_once('@') {
    Some((name, rev)) if !name.is_empty() && !rev.is_empty() => {
      (name.to_string(), Some(rev.to_string()))
    }
    _ => (repo_part.to_string(), None),
  };
  Some(ExternalRepoRef {
    repo_name,
    revision,
    path: file_part.to_string(),
  })
}

pub fn build_external_url(
  instance: &Url,
  external: &ExternalRepoRef,
  access_token: Option<&str>,
) -> Result<Url, AnyError> {
  let revision = external
    .revision
    .as_ref()
    .map(|rev| format!("@{}", rev))
    .unwrap_or_default();
  let mut url = instance
    .join(&format!(
      "/{}{}/-/raw/{}",
      external.repo_name, revision, external.path
    ))
    .map_err(|err| {
      mapping_error(format!(
        "could not build external URL for '{}': {}",
        external.repo_name, err
      ))
    })?;
  if let Some(token) = access_token {
    url.set_username(token).map_err(|_| {
      mapping_error("instance URL cannot carry credentials".to_string())
    })?;
  }
  Ok(url)
}

/// A file inside an installed dependency:
/// `<fileRoot>/.../node_modules/<name>/<relPath>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeModulesRef {
  pub name: String,
  pub package_root: Url,
  pub rel_path: String,
}

pub fn find_node_modules_package(url: &Url) -> Option<NodeModulesRef> {
  let segments: Vec<&str> = url.path_segments()?.collect();
  let idx = segments.iter().rposition(|s| *s == "node_modules")?;
  let mut name = segments.get(idx + 1)?.to_string();
  let mut rest_start = idx + 2;
  if name.starts_with('@') {
    name = format!("{}/{}", name, segments.get(idx + 2)?);
    rest_start = idx + 3;
  }
  if rest_start > segments.len() {
    return None;
  }
  let rel_path = segments[rest_start..].join("/");
  let root_path = format!("/{}/", segments[..rest_start].join("/"));
  let mut package_root = url.clone();
  package_root.set_path(&root_path);
  Some(NodeModulesRef {
    name,
    package_root,
    rel_path,
  })
}

/// Normalizes a manifest `repository` URL into a repo name of the
/// form `<host>/<owner>/<repo>`. Recognizes `git+` prefixes, scp-like
/// `git@host:owner/repo.git`, plain URLs, the GitHub
/// `tree/<ref>/<subdir>` shape (returned as the second element), and
/// `owner/repo` shorthand.
pub fn normalize_repository_url(
  raw: &str,
) -> Option<(String, Option<String>)> {
  let raw = raw.trim().trim_start_matches("git+");
  if let Some(rest) = raw.strip_prefix("git@") {
    let (host, path) = rest.split_once(':')?;
    let path = path.trim_end_matches(".git").trim_matches('/');
    return Some((format!("{}/{}", host, path), None));
  }
  if let Ok(url) = Url::parse(raw) {
    let host = url.host_str()?;
    let path = url.path().trim_matches('/').trim_end_matches(".git");
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() >= 4 && segments[2] == "tree" {
      let repo = format!("{}/{}/{}", host, segments[0], segments[1]);
      let subdir = segments[4..].join("/");
      let subdir = (!subdir.is_empty()).then_some(subdir);
      return Some((repo, subdir));
    }
    return Some((format!("{}/{}", host, path), None));
  }
  // "owner/repo" shorthand defaults to GitHub.
  if raw.split('/').count() == 2 && !raw.contains(':') {
    return Some((format!("github.com/{}", raw.trim_end_matches(".git")), None));
  }
  None
}

/// Where a published package lives: its repository name, the commit
/// it was published from, and the subdirectory it occupies inside
/// that repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRepo {
  pub repo_name: String,
  pub revision: Option<String>,
  pub subdir: Option<String>,
}

/// Reads a manifest's repository declaration. The subdirectory comes
/// from `repository.directory`, the `@types/<name>` DefinitelyTyped
/// convention, or a GitHub `tree/<ref>/<subdir>` URL, in that order.
/// A missing `gitHead` leaves the revision unpinned with a warning.
pub fn package_repo(
  manifest: &PackageJson,
  package_name: &str,
) -> Result<PackageRepo, AnyError> {
  let repository_url = manifest
    .repository
    .as_ref()
    .map(|repository| repository.url())
    .ok_or_else(|| {
      mapping_error(format!(
        "package '{}' declares no repository",
        package_name
      ))
    })?;
  let (repo_name, tree_subdir) = normalize_repository_url(repository_url)
    .ok_or_else(|| {
      mapping_error(format!(
        "could not understand repository URL '{}'",
        repository_url
      ))
    })?;
  let subdir = manifest
    .repository
    .as_ref()
    .and_then(|repository| repository.directory())
    .map(str::to_string)
    .or_else(|| {
      package_name
        .strip_prefix("@types/")
        .map(|rest| format!("types/{}", rest))
    })
    .or(tree_subdir);
  let revision = manifest.git_head.clone();
  if revision.is_none() {
    lsp_warn!(
      "Package '{}' has no published commit; external links will track the \
       repository head and may drift",
      package_name
    );
  }
  Ok(PackageRepo {
    repo_name,
    revision,
    subdir,
  })
}

/// Constructs the external-repo URL for a file under `node_modules`,
/// using the package manifest's repository declaration, its published
/// commit, and the subdirectory the package lives at inside its
/// repository.
pub fn resolve_external(
  file_url: &Url,
  manifest: &PackageJson,
  instance: &Url,
  access_token: Option<&str>,
) -> Result<Url, AnyError> {
  let node_modules_ref =
    find_node_modules_package(file_url).ok_or_else(|| {
      mapping_error(format!("not a dependency path: {}", file_url))
    })?;
  let repo = package_repo(manifest, &node_modules_ref.name)?;
  let path = match &repo.subdir {
    Some(subdir) => {
      format!("{}/{}", subdir.trim_matches('/'), node_modules_ref.rel_path)
    }
    None => node_modules_ref.rel_path.clone(),
  };
  build_external_url(
    instance,
    &ExternalRepoRef {
      repo_name: repo.repo_name,
      revision: repo.revision,
      path,
    },
    access_token,
  )
}

/// Path of `file_url` relative to the bundled TypeScript `lib/`
/// directory, when it points there.
pub fn typescript_lib_path(
  urls: &WorkspaceUrls,
  file_url: &Url,
) -> Option<String> {
  let lib_root =
    format!("{}node_modules/typescript/lib/", urls.file_root().as_str());
  file_url
    .as_str()
    .strip_prefix(lib_root.as_str())
    .map(str::to_string)
}

/// The upstream location of a bundled TypeScript lib file, pinned to
/// the embedded compiler version.
pub fn typescript_lib_url(
  lib_rel_path: &str,
  instance: &Url,
  access_token: Option<&str>,
) -> Result<Url, AnyError> {
  build_external_url(
    instance,
    &ExternalRepoRef {
      repo_name: TYPESCRIPT_REPO.to_string(),
      revision: Some(format!("v{}", TYPESCRIPT_VERSION)),
      path: format!("lib/{}", lib_rel_path),
    },
    access_token,
  )
}
