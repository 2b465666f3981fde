// Copyright 2025 the ts-gateway authors. MIT license.

use std::future::Future;

use crate::errors::is_cancelled;
use crate::errors::AnyError;
use crate::logging::lsp_warn;

/// Spawns a background fire-and-forget task. `Cancelled` outcomes are
/// swallowed, anything else is logged.
pub fn spawn_logged<F>(description: &'static str, future: F)
where
  F: Future<Output = Result<(), AnyError>> + Send + 'static,
{
  tokio::spawn(async move {
    if let Err(err) = future.await {
      if !is_cancelled(&err) {
        lsp_warn!("Background task '{}' failed: {:#}", description, err);
      }
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn spawn_logged_swallows_cancellation() {
    spawn_logged("noop", async { Ok(()) });
    spawn_logged("cancelled", async {
      Err(crate::errors::Cancelled.into())
    });
    tokio::task::yield_now().await;
  }
}
