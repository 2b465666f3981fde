// Copyright 2025 the ts-gateway authors. MIT license.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types as lsp;
use url::Url;

use crate::client::Client;
use crate::errors::AnyError;
use crate::errors::Cancelled;
use crate::errors::DownstreamError;
use crate::errors::FatalSpawnError;
use crate::logging::lsp_debug;
use crate::logging::lsp_log;
use crate::logging::lsp_warn;
use crate::urls::WorkspaceUrls;

/// Binary spoken to over stdio in production.
pub const LANGUAGE_SERVICE_BIN: &str = "typescript-language-server";

pub fn language_id_for_path(path: &str) -> &'static str {
  if path.ends_with(".tsx") {
    "typescriptreact"
  } else if path.ends_with(".jsx") {
    "javascriptreact"
  } else if path.ends_with(".js") {
    "javascript"
  } else if path.ends_with(".json") {
    "json"
  } else {
    "typescript"
  }
}

fn encode_frame(body: &Value) -> Vec<u8> {
  let body = serde_json::to_vec(body).unwrap_or_default();
  let mut frame =
    format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
  frame.extend_from_slice(&body);
  frame
}

pub(crate) async fn read_frame<R>(
  reader: &mut BufReader<R>,
) -> Result<Option<Value>, AnyError>
where
  R: AsyncRead + Unpin,
{
  let mut content_length: Option<usize> = None;
  loop {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
      return Ok(None);
    }
    let line = line.trim_end();
    if line.is_empty() {
      if content_length.is_some() {
        break;
      }
      continue;
    }
    if let Some(value) = line.strip_prefix("Content-Length:") {
      content_length = Some(value.trim().parse()?);
    }
  }
  let length = content_length.unwrap_or_default();
  let mut body = vec![0u8; length];
  reader.read_exact(&mut body).await?;
  Ok(Some(serde_json::from_slice(&body)?))
}

type ResponseSender = oneshot::Sender<Result<Value, DownstreamError>>;

/// One framed JSON-RPC connection to a child language service. The
/// transport is injected so tests run against an in-memory duplex
/// instead of a process.
pub struct LspConnection {
  next_id: AtomicI64,
  pending: Arc<DashMap<i64, ResponseSender>>,
  outgoing: mpsc::UnboundedSender<Vec<u8>>,
  child: parking_lot::Mutex<Option<tokio::process::Child>>,
  tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
  /// Cancelled once the transport is gone, in either direction.
  closed: CancellationToken,
}

impl LspConnection {
  pub fn new<R, W>(
    reader: R,
    writer: W,
    child: Option<tokio::process::Child>,
    diagnostics_tx: mpsc::UnboundedSender<lsp::PublishDiagnosticsParams>,
  ) -> Arc<Self>
  where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
  {
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let connection = Arc::new(Self {
      next_id: AtomicI64::new(1),
      pending: Arc::new(DashMap::new()),
      outgoing,
      child: parking_lot::Mutex::new(child),
      tasks: Default::default(),
      closed: CancellationToken::new(),
    });

    let writer_task = tokio::spawn(async move {
      let mut writer = writer;
      while let Some(frame) = outgoing_rx.recv().await {
        if writer.write_all(&frame).await.is_err() {
          break;
        }
        let _ = writer.flush().await;
      }
    });

    let reader_connection = connection.clone();
    let reader_task = tokio::spawn(async move {
      let mut reader = BufReader::new(reader);
      loop {
        match read_frame(&mut reader).await {
          Ok(Some(message)) => {
            reader_connection.dispatch(message, &diagnostics_tx);
          }
          Ok(None) => break,
          Err(err) => {
            lsp_warn!("Language service stream error: {:#}", err);
            break;
          }
        }
      }
      reader_connection.closed.cancel();
      reader_connection.pending.clear();
    });

    connection
      .tasks
      .lock()
      .extend([writer_task, reader_task]);
    connection
  }

  fn dispatch(
    &self,
    message: Value,
    diagnostics_tx: &mpsc::UnboundedSender<lsp::PublishDiagnosticsParams>,
  ) {
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").cloned();
    match (method, id) {
      (None, Some(id)) => {
        let Some(id) = id.as_i64() else {
          return;
        };
        if let Some((_, sender)) = self.pending.remove(&id) {
          let result = if let Some(error) = message.get("error") {
            Err(DownstreamError {
              code: error
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or_default(),
              message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
              data: error.get("data").cloned(),
            })
          } else {
            Ok(message.get("result").cloned().unwrap_or(Value::Null))
          };
          let _ = sender.send(result);
        }
      }
      (Some("textDocument/publishDiagnostics"), None) => {
        match serde_json::from_value(
          message.get("params").cloned().unwrap_or(Value::Null),
        ) {
          Ok(params) => {
            let _ = diagnostics_tx.send(params);
          }
          Err(err) => {
            lsp_warn!("Malformed diagnostics notification: {}", err);
          }
        }
      }
      (Some("window/logMessage"), None) => {
        if let Some(text) = message
          .pointer("/params/message")
          .and_then(Value::as_str)
        {
          lsp_debug!("language service: {}", text);
        }
      }
      (Some(method), Some(id)) => {
        // The gateway answers reverse requests with an empty result
        // so the child never blocks on them.
        lsp_debug!("Answering reverse request '{}' with null", method);
        let _ = self.outgoing.send(encode_frame(&json!({
          "jsonrpc": "2.0",
          "id": id,
          "result": Value::Null,
        })));
      }
      _ => {}
    }
  }

  pub async fn request(
    &self,
    method: &str,
    params: Value,
    token: &CancellationToken,
  ) -> Result<Value, AnyError> {
    if self.closed.is_cancelled() {
      anyhow::bail!("language service connection is closed");
    }
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (sender, receiver) = oneshot::channel();
    self.pending.insert(id, sender);
    self
      .outgoing
      .send(encode_frame(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
      })))
      .map_err(|_| anyhow::anyhow!("language service connection is closed"))?;

    tokio::select! {
      response = receiver => {
        match response {
          Ok(result) => Ok(result?),
          Err(_) => anyhow::bail!("language service connection is closed"),
        }
      }
      _ = token.cancelled() => {
        self.pending.remove(&id);
        let _ = self.notify("$/cancelRequest", json!({ "id": id }));
        Err(Cancelled.into())
      }
      _ = self.closed.cancelled() => {
        anyhow::bail!("language service connection is closed")
      }
    }
  }

  pub fn notify(&self, method: &str, params: Value) -> Result<(), AnyError> {
    self
      .outgoing
      .send(encode_frame(&json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
      })))
      .map_err(|_| anyhow::anyhow!("language service connection is closed"))
  }

  /// Releases the transport and fails everything in flight.
  pub async fn dispose(&self) {
    let _ = self.notify("exit", Value::Null);
    self.closed.cancel();
    for task in self.tasks.lock().drain(..) {
      task.abort();
    }
    if let Some(mut child) = self.child.lock().take() {
      let _ = child.start_kill();
    }
    self.pending.clear();
  }
}

/// Spawns (or re-spawns) the child language service.
#[async_trait]
pub trait LanguageServiceSpawner: Send + Sync {
  async fn spawn(
    &self,
    diagnostics_tx: mpsc::UnboundedSender<lsp::PublishDiagnosticsParams>,
  ) -> Result<Arc<LspConnection>, AnyError>;
}

#[derive(Debug)]
pub struct TsLanguageServiceSpawner {
  pub tsserver_cache_dir: PathBuf,
}

#[async_trait]
impl LanguageServiceSpawner for TsLanguageServiceSpawner {
  async fn spawn(
    &self,
    diagnostics_tx: mpsc::UnboundedSender<lsp::PublishDiagnosticsParams>,
  ) -> Result<Arc<LspConnection>, AnyError> {
    let mut child = tokio::process::Command::new(LANGUAGE_SERVICE_BIN)
      .arg("--stdio")
      .env("XDG_CACHE_HOME", &self.tsserver_cache_dir)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .kill_on_drop(true)
      .spawn()
      .map_err(FatalSpawnError)?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| anyhow::anyhow!("child stdout unavailable"))?;
    let stdin = child
      .stdin
      .take()
      .ok_or_else(|| anyhow::anyhow!("child stdin unavailable"))?;
    Ok(LspConnection::new(stdout, stdin, Some(child), diagnostics_tx))
  }
}

/// Owns the child language service across its restarts. Open
/// documents are recorded before they are announced and replayed in
/// insertion order with their last sent version whenever the child
/// is replaced. Requests arriving during a restart wait on the
/// connection lock.
pub struct TsServerSupervisor {
  spawner: Arc<dyn LanguageServiceSpawner>,
  conn: tokio::sync::RwLock<Option<Arc<LspConnection>>>,
  init_params: parking_lot::Mutex<Option<Value>>,
  open_documents: parking_lot::Mutex<IndexMap<Url, lsp::TextDocumentItem>>,
  diagnostics_tx: mpsc::UnboundedSender<lsp::PublishDiagnosticsParams>,
}

impl TsServerSupervisor {
  pub fn new(
    spawner: Arc<dyn LanguageServiceSpawner>,
  ) -> (
    Arc<Self>,
    mpsc::UnboundedReceiver<lsp::PublishDiagnosticsParams>,
  ) {
    let (diagnostics_tx, diagnostics_rx) = mpsc::unbounded_channel();
    (
      Arc::new(Self {
        spawner,
        conn: tokio::sync::RwLock::new(None),
        init_params: parking_lot::Mutex::new(None),
        open_documents: parking_lot::Mutex::new(IndexMap::new()),
        diagnostics_tx,
      }),
      diagnostics_rx,
    )
  }

  pub async fn start(
    &self,
    init_params: Value,
    token: &CancellationToken,
  ) -> Result<Value, AnyError> {
    let mut guard = self.conn.write().await;
    let connection = self.spawner.spawn(self.diagnostics_tx.clone()).await?;
    let result = connection
      .request("initialize", init_params.clone(), token)
      .await?;
    connection.notify("initialized", json!({}))?;
    *self.init_params.lock() = Some(init_params);
    *guard = Some(connection);
    Ok(result)
  }

  /// Disposes the current child, spawns a fresh one, re-sends the
  /// original initialize, then replays every open document.
  pub async fn restart(&self, token: &CancellationToken) -> Result<(), AnyError> {
    let init_params = self
      .init_params
      .lock()
      .clone()
      .ok_or_else(|| anyhow::anyhow!("language service was never started"))?;
    lsp_log!("Restarting the language service");
    let mut guard = self.conn.write().await;
    if let Some(old) = guard.take() {
      old.dispose().await;
    }
    let connection = self.spawner.spawn(self.diagnostics_tx.clone()).await?;
    connection.request("initialize", init_params, token).await?;
    connection.notify("initialized", json!({}))?;
    let documents: Vec<lsp::TextDocumentItem> =
      self.open_documents.lock().values().cloned().collect();
    for item in documents {
      connection
        .notify("textDocument/didOpen", json!({ "textDocument": item }))?;
    }
    *guard = Some(connection);
    Ok(())
  }

  async fn current(&self) -> Result<Arc<LspConnection>, AnyError> {
    self
      .conn
      .read()
      .await
      .clone()
      .ok_or_else(|| anyhow::anyhow!("language service is not running"))
  }

  pub async fn forward(
    &self,
    method: &str,
    params: Value,
    token: &CancellationToken,
  ) -> Result<Value, AnyError> {
    let connection = self.current().await?;
    connection.request(method, params, token).await
  }

  /// Records the document (client-supplied text wins over anything
  /// recorded earlier) and announces it downstream.
  pub async fn did_open(
    &self,
    item: lsp::TextDocumentItem,
  ) -> Result<(), AnyError> {
    self
      .open_documents
      .lock()
      .insert(item.uri.clone(), item.clone());
    let connection = self.current().await?;
    connection.notify("textDocument/didOpen", json!({ "textDocument": item }))
  }

  /// Announces a document at most once per file URL. The record is
  /// written before the notification goes out so a restart between
  /// the two still replays it.
  pub async fn ensure_open(
    &self,
    item: lsp::TextDocumentItem,
  ) -> Result<(), AnyError> {
    {
      let mut documents = self.open_documents.lock();
      if documents.contains_key(&item.uri) {
        return Ok(());
      }
      documents.insert(item.uri.clone(), item.clone());
    }
    let connection = self.current().await?;
    connection.notify("textDocument/didOpen", json!({ "textDocument": item }))
  }

  pub fn is_open(&self, url: &Url) -> bool {
    self.open_documents.lock().contains_key(url)
  }

  pub async fn dispose(&self) {
    if let Some(connection) = self.conn.write().await.take() {
      connection.dispose().await;
    }
  }
}

/// Forwards downstream diagnostics to the client: dependency paths
/// are dropped, everything else is rewritten into the public URL
/// space. A bad message is logged and skipped so it cannot stop the
/// stream. The subscription survives supervisor restarts because the
/// sender half is re-handed to every new connection.
pub fn spawn_diagnostics_forwarder(
  mut diagnostics_rx: mpsc::UnboundedReceiver<lsp::PublishDiagnosticsParams>,
  urls: Arc<WorkspaceUrls>,
  client: Client,
  enabled: bool,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    while let Some(mut params) = diagnostics_rx.recv().await {
      if !enabled {
        continue;
      }
      if params.uri.path().split('/').any(|s| s == "node_modules") {
        continue;
      }
      match urls.file_to_http(&params.uri) {
        Ok(uri) => {
          params.uri = uri;
          client.publish_diagnostics(params).await;
        }
        Err(err) => {
          lsp_warn!("Dropping diagnostics: {:#}", err);
        }
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::ClientTrait;

  /// Runs a scripted far end of the connection: answers initialize
  /// and echoes request params back as the result, recording
  /// everything it receives.
  fn run_scripted_service(
    stream: tokio::io::DuplexStream,
  ) -> Arc<parking_lot::Mutex<Vec<Value>>> {
    let received: Arc<parking_lot::Mutex<Vec<Value>>> = Default::default();
    let log = received.clone();
    tokio::spawn(async move {
      let (reader, mut writer) = tokio::io::split(stream);
      let mut reader = BufReader::new(reader);
      while let Ok(Some(message)) = read_frame(&mut reader).await {
        log.lock().push(message.clone());
        let Some(id) = message.get("id").cloned() else {
          continue;
        };
        let method =
          message.get("method").and_then(Value::as_str).unwrap_or("");
        let result = match method {
          "initialize" => json!({ "capabilities": {} }),
          _ => message.get("params").cloned().unwrap_or(Value::Null),
        };
        let frame = encode_frame(&json!({
          "jsonrpc": "2.0",
          "id": id,
          "result": result,
        }));
        if writer.write_all(&frame).await.is_err() {
          break;
        }
      }
    });
    received
  }

  #[derive(Default)]
  struct MockSpawner {
    peers: parking_lot::Mutex<Vec<Arc<parking_lot::Mutex<Vec<Value>>>>>,
  }

  #[async_trait]
  impl LanguageServiceSpawner for MockSpawner {
    async fn spawn(
      &self,
      diagnostics_tx: mpsc::UnboundedSender<lsp::PublishDiagnosticsParams>,
    ) -> Result<Arc<LspConnection>, AnyError> {
      let (near, far) = tokio::io::duplex(64 * 1024);
      let received = run_scripted_service(far);
      self.peers.lock().push(received);
      let (reader, writer) = tokio::io::split(near);
      Ok(LspConnection::new(reader, writer, None, diagnostics_tx))
    }
  }

  fn item(uri: &str, version: i32) -> lsp::TextDocumentItem {
    lsp::TextDocumentItem {
      uri: Url::parse(uri).unwrap(),
      language_id: "typescript".to_string(),
      version,
      text: format!("// {}", uri),
    }
  }

  fn methods(messages: &[Value]) -> Vec<String> {
    messages
      .iter()
      .filter_map(|m| m.get("method").and_then(Value::as_str))
      .map(str::to_string)
      .collect()
  }

  #[tokio::test]
  async fn forward_round_trips_through_the_scripted_service() {
    let spawner = Arc::new(MockSpawner::default());
    let (supervisor, _rx) = TsServerSupervisor::new(spawner);
    let token = CancellationToken::new();
    let result = supervisor
      .start(json!({ "rootUri": "file:///tmp/repo/" }), &token)
      .await
      .unwrap();
    assert_eq!(result, json!({ "capabilities": {} }));

    let params = json!({
      "textDocument": { "uri": "file:///tmp/repo/a.ts" },
      "position": { "line": 0, "character": 0 }
    });
    let echoed = supervisor
      .forward("textDocument/hover", params.clone(), &token)
      .await
      .unwrap();
    assert_eq!(echoed, params);
  }

  #[tokio::test]
  async fn restart_replays_open_documents_in_insertion_order() {
    let spawner = Arc::new(MockSpawner::default());
    let (supervisor, _rx) = TsServerSupervisor::new(spawner.clone());
    let token = CancellationToken::new();
    supervisor
      .start(json!({ "rootUri": "file:///tmp/repo/" }), &token)
      .await
      .unwrap();

    supervisor
      .did_open(item("file:///tmp/repo/a.ts", 7))
      .await
      .unwrap();
    supervisor
      .did_open(item("file:///tmp/repo/b.ts", 3))
      .await
      .unwrap();
    // ensure_open for an already-open document must not re-announce.
    supervisor
      .ensure_open(item("file:///tmp/repo/a.ts", 0))
      .await
      .unwrap();

    supervisor.restart(&token).await.unwrap();
    // Give the replayed notifications time to land at the peer.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let peers = spawner.peers.lock();
    assert_eq!(peers.len(), 2);
    let replayed = peers[1].lock().clone();
    assert_eq!(
      methods(&replayed),
      vec![
        "initialize",
        "initialized",
        "textDocument/didOpen",
        "textDocument/didOpen"
      ]
    );
    let first = &replayed[2]["params"]["textDocument"];
    let second = &replayed[3]["params"]["textDocument"];
    assert_eq!(first["uri"], "file:///tmp/repo/a.ts");
    // The client-sent version survives the replay verbatim.
    assert_eq!(first["version"], 7);
    assert_eq!(second["uri"], "file:///tmp/repo/b.ts");
    assert_eq!(second["version"], 3);
  }

  #[tokio::test]
  async fn cancelling_a_request_sends_cancel_downstream() {
    let spawner = Arc::new(MockSpawner::default());
    let (supervisor, _rx) = TsServerSupervisor::new(spawner.clone());
    let session_token = CancellationToken::new();
    supervisor
      .start(json!({}), &session_token)
      .await
      .unwrap();

    let request_token = session_token.child_token();
    request_token.cancel();
    let err = supervisor
      .forward("textDocument/hover", json!({}), &request_token)
      .await
      .unwrap_err();
    assert!(crate::errors::is_cancelled(&err));

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let peers = spawner.peers.lock();
    let received = peers[0].lock().clone();
    assert!(methods(&received).contains(&"$/cancelRequest".to_string()));
  }

  #[derive(Default)]
  struct RecordingClient {
    published: parking_lot::Mutex<Vec<lsp::PublishDiagnosticsParams>>,
  }

  #[async_trait]
  impl ClientTrait for RecordingClient {
    async fn publish_diagnostics(
      &self,
      params: lsp::PublishDiagnosticsParams,
    ) {
      self.published.lock().push(params);
    }

    async fn show_message(&self, _typ: lsp::MessageType, _message: String) {}

    async fn send_progress(&self, _params: lsp::ProgressParams) {}

    async fn create_work_done_progress(
      &self,
      _token: lsp::NumberOrString,
    ) -> Result<(), AnyError> {
      Ok(())
    }
  }

  fn diagnostics(uri: &str) -> lsp::PublishDiagnosticsParams {
    lsp::PublishDiagnosticsParams {
      uri: Url::parse(uri).unwrap(),
      diagnostics: vec![lsp::Diagnostic {
        range: lsp::Range::default(),
        message: "boom".to_string(),
        ..Default::default()
      }],
      version: None,
    }
  }

  #[tokio::test]
  async fn diagnostics_forwarder_filters_and_rewrites() {
    let urls = Arc::new(WorkspaceUrls::new(
      Url::parse("https://h/repo@abc/-/raw/").unwrap(),
      Url::parse("file:///tmp/session/repo/").unwrap(),
    ));
    let recording = Arc::new(RecordingClient::default());
    let client = Client::new(recording.clone());
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = spawn_diagnostics_forwarder(rx, urls, client, true);

    tx.send(diagnostics(
      "file:///tmp/session/repo/node_modules/x/y.ts",
    ))
    .unwrap();
    tx.send(diagnostics("file:///tmp/session/repo/src/z.ts"))
      .unwrap();
    tx.send(diagnostics("file:///somewhere/else.ts")).unwrap();
    drop(tx);
    handle.await.unwrap();

    let published = recording.published.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(
      published[0].uri.as_str(),
      "https://h/repo@abc/-/raw/src/z.ts"
    );
  }

  #[tokio::test]
  async fn diagnostics_forwarder_drops_everything_when_disabled() {
    let urls = Arc::new(WorkspaceUrls::new(
      Url::parse("https://h/repo@abc/-/raw/").unwrap(),
      Url::parse("file:///tmp/session/repo/").unwrap(),
    ));
    let recording = Arc::new(RecordingClient::default());
    let client = Client::new(recording.clone());
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = spawn_diagnostics_forwarder(rx, urls, client, false);
    tx.send(diagnostics("file:///tmp/session/repo/src/z.ts"))
      .unwrap();
    drop(tx);
    handle.await.unwrap();
    assert!(recording.published.lock().is_empty());
  }

  #[test]
  fn language_ids_follow_extensions() {
    assert_eq!(language_id_for_path("a.ts"), "typescript");
    assert_eq!(language_id_for_path("a.d.ts"), "typescript");
    assert_eq!(language_id_for_path("a.tsx"), "typescriptreact");
    assert_eq!(language_id_for_path("a.js"), "javascript");
    assert_eq!(language_id_for_path("a.jsx"), "javascriptreact");
    assert_eq!(language_id_for_path("package.json"), "json");
  }
}
