// Copyright 2025 the ts-gateway authors. MIT license.

use std::sync::Arc;

use async_trait::async_trait;
use tower_lsp::lsp_types as lsp;

use crate::errors::AnyError;
use crate::logging::lsp_debug;

/// Outbound handle to the connected client. The indirection mirrors
/// the downstream supervisor's spawner trait: tests subscribe a
/// recording implementation, production wraps `tower_lsp::Client`.
#[derive(Clone)]
pub struct Client(Arc<dyn ClientTrait>);

impl std::fmt::Debug for Client {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Client").finish()
  }
}

#[async_trait]
pub trait ClientTrait: Send + Sync {
  async fn publish_diagnostics(&self, params: lsp::PublishDiagnosticsParams);
  async fn show_message(&self, typ: lsp::MessageType, message: String);
  async fn send_progress(&self, params: lsp::ProgressParams);
  async fn create_work_done_progress(
    &self,
    token: lsp::NumberOrString,
  ) -> Result<(), AnyError>;
}

impl Client {
  pub fn from_tower(client: tower_lsp::Client) -> Self {
    Self(Arc::new(TowerClient(client)))
  }

  pub fn new(inner: Arc<dyn ClientTrait>) -> Self {
    Self(inner)
  }

  /// A client that drops everything. Used before initialize and in
  /// tests that do not observe outbound traffic.
  pub fn null() -> Self {
    Self(Arc::new(NullClient))
  }

  pub async fn publish_diagnostics(
    &self,
    params: lsp::PublishDiagnosticsParams,
  ) {
    self.0.publish_diagnostics(params).await;
  }

  pub async fn show_message(
    &self,
    typ: lsp::MessageType,
    message: impl std::fmt::Display,
  ) {
    self.0.show_message(typ, message.to_string()).await;
  }

  pub async fn send_progress(&self, params: lsp::ProgressParams) {
    self.0.send_progress(params).await;
  }

  pub async fn create_work_done_progress(
    &self,
    token: lsp::NumberOrString,
  ) -> Result<(), AnyError> {
    self.0.create_work_done_progress(token).await
  }
}

struct TowerClient(tower_lsp::Client);

#[async_trait]
impl ClientTrait for TowerClient {
  async fn publish_diagnostics(&self, params: lsp::PublishDiagnosticsParams) {
    self
      .0
      .publish_diagnostics(params.uri, params.diagnostics, params.version)
      .await;
  }

  async fn show_message(&self, typ: lsp::MessageType, message: String) {
    self.0.show_message(typ, message).await;
  }

  async fn send_progress(&self, params: lsp::ProgressParams) {
    self
      .0
      .send_notification::<lsp::notification::Progress>(params)
      .await;
  }

  async fn create_work_done_progress(
    &self,
    token: lsp::NumberOrString,
  ) -> Result<(), AnyError> {
    self
      .0
      .send_request::<lsp::request::WorkDoneProgressCreate>(
        lsp::WorkDoneProgressCreateParams { token },
      )
      .await
      .map_err(|err| anyhow::anyhow!("progress create rejected: {}", err))
  }
}

struct NullClient;

#[async_trait]
impl ClientTrait for NullClient {
  async fn publish_diagnostics(&self, _params: lsp::PublishDiagnosticsParams) {
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

/// A single `$/progress` stream. Inert when the client does not
/// support work-done progress or the session disabled it.
pub struct ProgressReporter {
  client: Client,
  token: lsp::NumberOrString,
  active: bool,
}

impl ProgressReporter {
  pub async fn begin(client: Client, id: String, title: &str, enabled: bool) -> Self {
    let token = lsp::NumberOrString::String(id);
    let active = enabled
      && match client.create_work_done_progress(token.clone()).await {
        Ok(()) => true,
        Err(err) => {
          lsp_debug!("Progress disabled: {:#}", err);
          false
        }
      };
    let reporter = Self {
      client,
      token,
      active,
    };
    if reporter.active {
      reporter
        .send(lsp::WorkDoneProgress::Begin(lsp::WorkDoneProgressBegin {
          title: title.to_string(),
          cancellable: Some(false),
          message: None,
          percentage: Some(0),
        }))
        .await;
    }
    reporter
  }

  pub async fn report_percent(&self, percentage: u32) {
    if self.active {
      self
        .send(lsp::WorkDoneProgress::Report(lsp::WorkDoneProgressReport {
          cancellable: Some(false),
          message: None,
          percentage: Some(percentage.min(100)),
        }))
        .await;
    }
  }

  pub async fn end(&self, message: Option<String>) {
    if self.active {
      self
        .send(lsp::WorkDoneProgress::End(lsp::WorkDoneProgressEnd {
          message,
        }))
        .await;
    }
  }

  async fn send(&self, value: lsp::WorkDoneProgress) {
    self
      .client
      .send_progress(lsp::ProgressParams {
        token: self.token.clone(),
        value: lsp::ProgressParamsValue::WorkDone(value),
      })
      .await;
  }
}
