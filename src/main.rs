// Copyright 2025 the ts-gateway authors. MIT license.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tower_lsp::LspService;
use tower_lsp::Server;
use ts_gateway::session::Session;
use ts_gateway::GatewayOptions;
use ts_gateway::GatewayServer;

#[tokio::main]
async fn main() {
  env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or("info"),
  )
  .init();

  let temp_root = std::env::var_os("TS_GATEWAY_CACHE_DIR")
    .map(std::path::PathBuf::from)
    .unwrap_or_else(|| std::env::temp_dir().join("ts-gateway"));
  if let Err(err) = std::fs::create_dir_all(&temp_root) {
    eprintln!("could not create '{}': {}", temp_root.display(), err);
    std::process::exit(1);
  }

  let session_slot: Arc<OnceCell<Arc<Session>>> = Default::default();
  let slot = session_slot.clone();
  let (service, socket) = LspService::new(move |client| {
    let server =
      GatewayServer::new(client, GatewayOptions::new(temp_root.clone()));
    let _ = slot.set(server.session().clone());
    server
  });
  Server::new(tokio::io::stdin(), tokio::io::stdout(), socket)
    .serve(service)
    .await;

  // The client may drop the connection without a shutdown request;
  // workspace resources are released either way.
  if let Some(session) = session_slot.get() {
    session.dispose().await;
  }
}
