// Copyright 2025 the ts-gateway authors. MIT license.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

pub type AnyError = anyhow::Error;

/// Cooperative cancellation. Never logged as an error; re-raised to
/// abort all suspended tasks in the current scope.
#[derive(Debug, Clone, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// The target of a lookup does not exist. Expected during best-effort
/// probes (map files, parent manifests); the caller decides whether
/// to fall back.
#[derive(Debug, Clone, Error)]
#[error("resource not found: {0}")]
pub struct ResourceNotFound(pub Url);

/// Bad request parameters, surfaced as the request failure.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// URI escape, cross-repo resolution failure, or a source map that
/// emitted a null component. Fails the offending request only.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MappingError(pub String);

/// An error response from the downstream language service, forwarded
/// verbatim with its message.
#[derive(Debug, Clone, Error)]
#[error("language service error {code}: {message}")]
pub struct DownstreamError {
  pub code: i64,
  pub message: String,
  pub data: Option<serde_json::Value>,
}

/// The downstream language service could not be started. Not
/// recoverable within a session.
#[derive(Debug, Error)]
#[error("failed to start language service: {0}")]
pub struct FatalSpawnError(#[source] pub std::io::Error);

pub fn mapping_error(message: impl Into<String>) -> AnyError {
  MappingError(message.into()).into()
}

pub fn validation_error(message: impl Into<String>) -> AnyError {
  ValidationError(message.into()).into()
}

pub fn is_cancelled(err: &AnyError) -> bool {
  err.downcast_ref::<Cancelled>().is_some()
}

pub fn is_not_found(err: &AnyError) -> bool {
  err.downcast_ref::<ResourceNotFound>().is_some()
}

/// Checked at every suspension boundary.
pub fn check_cancelled(token: &CancellationToken) -> Result<(), AnyError> {
  if token.is_cancelled() {
    Err(Cancelled.into())
  } else {
    Ok(())
  }
}
