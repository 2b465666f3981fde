// Copyright 2025 the ts-gateway authors. MIT license.

use std::io::Read;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use flate2::read::GzDecoder;
use futures::StreamExt;
use tar::Archive;
use tar::EntryType;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::ProgressReporter;
use crate::errors::check_cancelled;
use crate::errors::validation_error;
use crate::errors::AnyError;
use crate::logging::lsp_debug;

/// File kinds kept when expanding the workspace archive. Everything
/// else (images, lockfiles, build output) is skipped.
const WORKSPACE_EXTENSIONS: [&str; 6] =
  [".d.ts", ".ts", ".tsx", ".js", ".jsx", ".json"];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub struct MaterializedWorkspace {
  /// Directory URLs under the HTTP root that contain a
  /// `package.json`, excluding anything under `node_modules/`.
  pub manifest_dirs: Vec<Url>,
}

fn is_workspace_file(name: &str) -> bool {
  WORKSPACE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

pub fn check_archive_content_type(
  content_type: Option<&str>,
) -> Result<(), AnyError> {
  match content_type {
    Some(value) if value.starts_with("application/") => Ok(()),
    Some(value) => Err(validation_error(format!(
      "expected an archive response, got content type '{}'",
      value
    ))),
    None => Err(validation_error(
      "archive response carried no content type".to_string(),
    )),
  }
}

/// Streams the workspace archive at `http_root` and expands it into
/// `dest`. Progress percentage is derived from the content-length
/// header when present. Cancellation aborts the stream; whatever was
/// extracted is cleaned up with the session temp directory.
pub async fn fetch_workspace_archive(
  http_root: &Url,
  dest: &Path,
  client: &reqwest::Client,
  access_token: Option<&str>,
  progress: &ProgressReporter,
  token: &CancellationToken,
) -> Result<MaterializedWorkspace, AnyError> {
  check_cancelled(token)?;
  let mut request = client
    .get(http_root.clone())
    .header(reqwest::header::ACCEPT, "application/x-tar");
  if let Some(access_token) = access_token {
    request = request.bearer_auth(access_token);
  }
  let response = request.send().await?.error_for_status()?;
  let content_type = response
    .headers()
    .get(reqwest::header::CONTENT_TYPE)
    .and_then(|value| value.to_str().ok())
    .map(|value| value.to_string());
  check_archive_content_type(content_type.as_deref())?;

  let content_length = response.content_length();
  let mut data = Vec::with_capacity(
    content_length.map(|len| len as usize).unwrap_or(64 * 1024),
  );
  let mut last_reported = 0;
  let mut stream = response.bytes_stream();
  while let Some(chunk) = stream.next().await {
    check_cancelled(token)?;
    let chunk = chunk?;
    data.extend_from_slice(&chunk);
    if let Some(total) = content_length {
      let percent = (data.len() as u64 * 100 / total.max(1)) as u32;
      if percent > last_reported {
        last_reported = percent;
        progress.report_percent(percent).await;
      }
    }
  }
  check_cancelled(token)?;
  lsp_debug!(
    "Downloaded workspace archive: {} bytes from {}",
    data.len(),
    http_root
  );

  let manifest_dirs = extract_workspace_tar(&data, dest, http_root)?;
  Ok(MaterializedWorkspace { manifest_dirs })
}

/// Expands a (possibly gzipped) tar stream into `dest`, keeping only
/// workspace file kinds and recording manifest directories. Every
/// written path is checked to stay inside `dest`.
pub fn extract_workspace_tar(
  data: &[u8],
  dest: &Path,
  http_root: &Url,
) -> Result<Vec<Url>, AnyError> {
  std::fs::create_dir_all(dest)?;
  let dest = std::fs::canonicalize(dest)?;
  let reader: Box<dyn Read + '_> = if data.starts_with(&GZIP_MAGIC) {
    Box::new(GzDecoder::new(data))
  } else {
    Box::new(data)
  };
  let mut archive = Archive::new(reader);
  archive.set_overwrite(true);

  let mut manifest_dirs = Vec::new();
  for entry in archive.entries()? {
    let mut entry = entry?;
    if entry.header().entry_type() != EntryType::Regular {
      continue;
    }
    let path = entry.path()?.into_owned();
    let Some(rel) = sanitize_entry_path(&path) else {
      anyhow::bail!(
        "archive entry '{}' would escape the workspace",
        path.display()
      );
    };
    let Some(name) = rel.file_name().and_then(|name| name.to_str()) else {
      continue;
    };
    if !is_workspace_file(name) {
      continue;
    }
    let in_node_modules = rel
      .components()
      .any(|component| component.as_os_str() == "node_modules");
    if name == "package.json" && !in_node_modules {
      if let Some(dir) = manifest_dir_url(http_root, &rel) {
        manifest_dirs.push(dir);
      }
    }
    let absolute = dest.join(&rel);
    if let Some(parent) = absolute.parent() {
      std::fs::create_dir_all(parent)?;
      let canonical_parent = std::fs::canonicalize(parent)?;
      if !canonical_parent.starts_with(&dest) {
        anyhow::bail!(
          "archive entry '{}' would escape the workspace",
          path.display()
        );
      }
    }
    entry.unpack(&absolute)?;
  }
  Ok(manifest_dirs)
}

/// Rejects absolute paths and any `..` component.
fn sanitize_entry_path(path: &Path) -> Option<PathBuf> {
  let mut rel = PathBuf::new();
  for component in path.components() {
    match component {
      Component::Normal(part) => rel.push(part),
      Component::CurDir => {}
      _ => return None,
    }
  }
  (!rel.as_os_str().is_empty()).then_some(rel)
}

fn manifest_dir_url(http_root: &Url, rel: &Path) -> Option<Url> {
  let parent = rel.parent()?;
  let mut dir = String::new();
  for component in parent.components() {
    dir.push_str(component.as_os_str().to_str()?);
    dir.push('/');
  }
  http_root.join(&dir).ok()
}
