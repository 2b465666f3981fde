// Copyright 2025 the ts-gateway authors. MIT license.

use std::sync::Arc;

use futures::StreamExt;
use sourcemap::SourceMap;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types as lsp;
use url::Url;

use crate::errors::check_cancelled;
use crate::errors::is_not_found;
use crate::errors::AnyError;
use crate::logging::lsp_debug;
use crate::logging::lsp_warn;
use crate::package_json::PackageJson;
use crate::resources::ResourceProvider;
use crate::resources::ResourceRetriever;
use crate::urls::find_node_modules_package;

/// Width of concurrent fan-out when scanning declaration maps or
/// probing external manifests.
pub const FAN_OUT_WIDTH: usize = 10;

/// Maps positions between declaration files inside `node_modules`
/// and the sources they were generated from, in both directions.
pub struct SourceMapResolver {
  resources: Arc<ResourceProvider>,
  /// Everything a mapping may produce must stay under this root;
  /// sources pointing outside the session directory are discarded.
  workspace_root: Url,
}

impl SourceMapResolver {
  pub fn new(resources: Arc<ResourceProvider>, workspace_root: Url) -> Self {
    Self {
      resources,
      workspace_root,
    }
  }

  /// Outgoing conversion: a downstream result pointing at a
  /// declaration file is rewritten to the original source when a
  /// sibling `.map` exists and maps the position inside the session
  /// directory. Failures other than a missing map are logged; the
  /// declaration location is kept in every fallback case.
  pub async fn map_declaration_location(
    &self,
    location: &lsp::Location,
    token: &CancellationToken,
  ) -> Option<lsp::Location> {
    let map_url = Url::parse(&format!("{}.map", location.uri)).ok()?;
    let bytes = match self.resources.file().fetch(&map_url, token).await {
      Ok(bytes) => bytes,
      Err(err) => {
        if !is_not_found(&err) {
          lsp_warn!("Could not read '{}': {:#}", map_url, err);
        }
        return None;
      }
    };
    let map = match SourceMap::from_slice(&bytes) {
      Ok(map) => map,
      Err(err) => {
        lsp_warn!("Invalid source map '{}': {}", map_url, err);
        return None;
      }
    };

    let start = self.lookup_original(&map, &map_url, &location.range.start)?;
    let end = self
      .lookup_original(&map, &map_url, &location.range.end)
      .filter(|(url, _)| *url == start.0)
      .map(|(_, position)| position)
      .unwrap_or(start.1);
    Some(lsp::Location {
      uri: start.0,
      range: lsp::Range {
        start: start.1,
        end,
      },
    })
  }

  fn lookup_original(
    &self,
    map: &SourceMap,
    map_url: &Url,
    position: &lsp::Position,
  ) -> Option<(Url, lsp::Position)> {
    let token = map.lookup_token(position.line, position.character)?;
    let Some(source) = token.get_source() else {
      lsp_debug!("Source map '{}' emitted a null source", map_url);
      return None;
    };
    let resolved = map_url.join(source).ok()?;
    if !resolved
      .as_str()
      .starts_with(self.workspace_root.as_str())
    {
      lsp_debug!(
        "Discarding mapping outside the session directory: {}",
        resolved
      );
      return None;
    }
    Some((
      resolved,
      lsp::Position {
        line: token.get_src_line(),
        character: token.get_src_col(),
      },
    ))
  }

  /// Incoming conversion: a position inside an external package is
  /// resolved to a file inside this workspace's `node_modules`.
  /// First probes for the file verbatim, then scans the package's
  /// declaration maps for one generated from that source.
  pub async fn resolve_incoming_position(
    &self,
    package_name: &str,
    package_rel_path: &str,
    position: lsp::Position,
    token: &CancellationToken,
  ) -> Result<Option<(Url, lsp::Position)>, AnyError> {
    check_cancelled(token)?;
    let file = self.resources.file();
    let verbatim = file
      .glob(
        &self.workspace_root,
        &format!("**/node_modules/{}/{}", package_name, package_rel_path),
        &[],
        token,
      )
      .await?;
    if let Some(url) = verbatim.into_iter().next() {
      return Ok(Some((url, position)));
    }

    let map_urls = file
      .glob(
        &self.workspace_root,
        &format!("**/node_modules/{}/**/*.d.ts.map", package_name),
        &[],
        token,
      )
      .await?;
    let mut scans = futures::stream::iter(map_urls.into_iter().map(
      |map_url| {
        let file = file.clone();
        let token = token.clone();
        async move {
          match self
            .scan_declaration_map(&*file, &map_url, package_rel_path, position, &token)
            .await
          {
            Ok(hit) => hit,
            Err(err) => {
              if !is_not_found(&err) {
                lsp_warn!("Skipping '{}': {:#}", map_url, err);
              }
              None
            }
          }
        }
      },
    ))
    .buffer_unordered(FAN_OUT_WIDTH);
    while let Some(hit) = scans.next().await {
      check_cancelled(token)?;
      if hit.is_some() {
        return Ok(hit);
      }
    }
    Ok(None)
  }

  /// Opens one declaration map and, when one of its sources is the
  /// wanted file, inverts the map at the given source position.
  async fn scan_declaration_map(
    &self,
    file: &dyn ResourceRetriever,
    map_url: &Url,
    package_rel_path: &str,
    position: lsp::Position,
    token: &CancellationToken,
  ) -> Result<Option<(Url, lsp::Position)>, AnyError> {
    check_cancelled(token)?;
    let bytes = file.fetch(map_url, token).await?;
    let map = SourceMap::from_slice(&bytes)?;
    let Some(package_root) =
      find_node_modules_package(map_url).map(|found| found.package_root)
    else {
      return Ok(None);
    };

    let mut matched_source = None;
    for source in map.sources() {
      let Ok(resolved) = map_url.join(source) else {
        continue;
      };
      let rel = resolved.as_str().strip_prefix(package_root.as_str());
      if rel == Some(package_rel_path) {
        matched_source = Some(source.to_string());
        break;
      }
    }
    let Some(matched_source) = matched_source else {
      return Ok(None);
    };

    // Best token on the wanted source line: the closest mapping at
    // or before the wanted column, else the first on the line.
    let mut best: Option<sourcemap::Token> = None;
    for map_token in map.tokens() {
      if map_token.get_source() != Some(matched_source.as_str())
        || map_token.get_src_line() != position.line
      {
        continue;
      }
      let candidate_col = map_token.get_src_col();
      match &best {
        None => best = Some(map_token),
        Some(current) => {
          let current_col = current.get_src_col();
          let closer_before = candidate_col <= position.character
            && (current_col > position.character
              || candidate_col > current_col);
          if closer_before {
            best = Some(map_token);
          }
        }
      }
    }
    let Some(best) = best else {
      return Ok(None);
    };

    let declaration_url = Url::parse(
      map_url
        .as_str()
        .strip_suffix(".map")
        .unwrap_or(map_url.as_str()),
    )?;
    Ok(Some((
      declaration_url,
      lsp::Position {
        line: best.get_dst_line(),
        character: best.get_dst_col(),
      },
    )))
  }
}

/// Splits a repository-relative path into the owning package's name
/// and the path inside that package. DefinitelyTyped layouts are
/// recognized structurally (`types/<name>/[v<ver>/]...` becomes
/// `@types/<name>`); anything else asks the retriever for the
/// nearest enclosing `package.json`.
pub async fn find_package_root_and_name(
  raw_root: &Url,
  rel_path: &str,
  retriever: &dyn ResourceRetriever,
  token: &CancellationToken,
) -> Result<Option<(String, String)>, AnyError> {
  let segments: Vec<&str> = rel_path.split('/').collect();
  if let Some(idx) = segments.iter().position(|s| *s == "types") {
    if let Some(name) = segments.get(idx + 1) {
      let mut rest_start = idx + 2;
      if segments
        .get(rest_start)
        .map(|s| is_version_dir(s))
        .unwrap_or(false)
      {
        rest_start += 1;
      }
      let rest = segments[rest_start..].join("/");
      return Ok(Some((format!("@types/{}", name), rest)));
    }
  }

  // Walk from the file's directory toward the repository root and
  // read the first manifest that declares a name.
  let mut dir_segments: Vec<&str> = segments[..segments.len() - 1].to_vec();
  loop {
    check_cancelled(token)?;
    let dir = if dir_segments.is_empty() {
      String::new()
    } else {
      format!("{}/", dir_segments.join("/"))
    };
    let manifest_url = raw_root.join(&format!("{}package.json", dir))?;
    match retriever.fetch(&manifest_url, token).await {
      Ok(bytes) => {
        if let Ok(manifest) = PackageJson::from_slice(&bytes) {
          if let Some(name) = manifest.name {
            let rest = segments[dir_segments.len()..].join("/");
            return Ok(Some((name, rest)));
          }
        }
      }
      Err(err) if is_not_found(&err) => {}
      Err(err) => return Err(err),
    }
    if dir_segments.is_empty() {
      return Ok(None);
    }
    dir_segments.pop();
  }
}

fn is_version_dir(segment: &str) -> bool {
  segment
    .strip_prefix('v')
    .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::resources::FileRetriever;
  use crate::resources::HttpRetriever;

  const SIMPLE_MAP: &str = r#"{
    "version": 3,
    "file": "index.d.ts",
    "sourceRoot": "",
    "sources": ["../src/index.ts"],
    "names": [],
    "mappings": "AAAA"
  }"#;

  const ESCAPING_MAP: &str = r#"{
    "version": 3,
    "file": "index.d.ts",
    "sourceRoot": "",
    "sources": ["../../../../../outside.ts"],
    "names": [],
    "mappings": "AAAA"
  }"#;

  struct Fixture {
    _dir: tempfile::TempDir,
    resolver: SourceMapResolver,
    root: std::path::PathBuf,
  }

  fn fixture() -> Fixture {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let pkg = root.join("node_modules/other-pkg");
    std::fs::create_dir_all(pkg.join("dist")).unwrap();
    std::fs::create_dir_all(pkg.join("src")).unwrap();
    std::fs::write(pkg.join("dist/index.d.ts"), "export declare const x: 1;")
      .unwrap();
    std::fs::write(pkg.join("dist/index.d.ts.map"), SIMPLE_MAP).unwrap();
    std::fs::write(pkg.join("src/index.ts"), "export const x = 1;").unwrap();

    let resources = Arc::new(ResourceProvider::new(
      Arc::new(FileRetriever),
      Arc::new(HttpRetriever::new(reqwest::Client::new(), None)),
    ));
    let resolver = SourceMapResolver::new(
      resources,
      Url::from_directory_path(&root).unwrap(),
    );
    Fixture {
      _dir: dir,
      resolver,
      root,
    }
  }

  fn token() -> CancellationToken {
    CancellationToken::new()
  }

  #[tokio::test]
  async fn outgoing_mapping_rewrites_to_the_source_file() {
    let fixture = fixture();
    let declaration = lsp::Location {
      uri: Url::from_file_path(
        fixture.root.join("node_modules/other-pkg/dist/index.d.ts"),
      )
      .unwrap(),
      range: lsp::Range::default(),
    };
    let mapped = fixture
      .resolver
      .map_declaration_location(&declaration, &token())
      .await
      .unwrap();
    assert!(mapped.uri.as_str().ends_with("node_modules/other-pkg/src/index.ts"));
    assert_eq!(mapped.range.start, lsp::Position::new(0, 0));
  }

  #[tokio::test]
  async fn outgoing_mapping_without_a_map_file_is_a_miss() {
    let fixture = fixture();
    let location = lsp::Location {
      uri: Url::from_file_path(
        fixture.root.join("node_modules/other-pkg/src/index.ts"),
      )
      .unwrap(),
      range: lsp::Range::default(),
    };
    assert!(fixture
      .resolver
      .map_declaration_location(&location, &token())
      .await
      .is_none());
  }

  #[tokio::test]
  async fn mappings_escaping_the_session_directory_are_discarded() {
    let fixture = fixture();
    let map_path = fixture
      .root
      .join("node_modules/other-pkg/dist/index.d.ts.map");
    std::fs::write(&map_path, ESCAPING_MAP).unwrap();
    let declaration = lsp::Location {
      uri: Url::from_file_path(
        fixture.root.join("node_modules/other-pkg/dist/index.d.ts"),
      )
      .unwrap(),
      range: lsp::Range::default(),
    };
    assert!(fixture
      .resolver
      .map_declaration_location(&declaration, &token())
      .await
      .is_none());
  }

  #[tokio::test]
  async fn incoming_position_prefers_the_verbatim_file() {
    let fixture = fixture();
    let (url, position) = fixture
      .resolver
      .resolve_incoming_position(
        "other-pkg",
        "src/index.ts",
        lsp::Position::new(0, 0),
        &token(),
      )
      .await
      .unwrap()
      .unwrap();
    assert!(url.as_str().ends_with("node_modules/other-pkg/src/index.ts"));
    assert_eq!(position, lsp::Position::new(0, 0));
  }

  #[tokio::test]
  async fn incoming_position_falls_back_to_declaration_maps() {
    let fixture = fixture();
    // Remove the verbatim source so only the declaration map can
    // answer.
    std::fs::remove_file(
      fixture.root.join("node_modules/other-pkg/src/index.ts"),
    )
    .unwrap();
    let (url, position) = fixture
      .resolver
      .resolve_incoming_position(
        "other-pkg",
        "src/index.ts",
        lsp::Position::new(0, 0),
        &token(),
      )
      .await
      .unwrap()
      .unwrap();
    assert!(url.as_str().ends_with("node_modules/other-pkg/dist/index.d.ts"));
    assert_eq!(position, lsp::Position::new(0, 0));
  }

  #[tokio::test]
  async fn incoming_position_misses_for_unknown_packages() {
    let fixture = fixture();
    let hit = fixture
      .resolver
      .resolve_incoming_position(
        "nonexistent",
        "src/index.ts",
        lsp::Position::new(0, 0),
        &token(),
      )
      .await
      .unwrap();
    assert!(hit.is_none());
  }

  #[test]
  fn definitely_typed_paths_yield_types_packages() {
    let raw_root = Url::parse("https://h/dt@abc/-/raw/").unwrap();
    let retriever = FileRetriever;
    let result = futures::executor::block_on(find_package_root_and_name(
      &raw_root,
      "types/lodash/v4/index.d.ts",
      &retriever,
      &token(),
    ))
    .unwrap()
    .unwrap();
    assert_eq!(result.0, "@types/lodash");
    assert_eq!(result.1, "index.d.ts");

    let result = futures::executor::block_on(find_package_root_and_name(
      &raw_root,
      "types/node/fs.d.ts",
      &retriever,
      &token(),
    ))
    .unwrap()
    .unwrap();
    assert_eq!(result.0, "@types/node");
    assert_eq!(result.1, "fs.d.ts");
  }
}
