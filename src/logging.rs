// Copyright 2025 the ts-gateway authors. MIT license.

macro_rules! lsp_log {
  ($($arg:tt)+) => (
    log::info!(target: "ts_gateway::lsp", $($arg)+)
  )
}

macro_rules! lsp_warn {
  ($($arg:tt)+) => (
    log::warn!(target: "ts_gateway::lsp", $($arg)+)
  )
}

macro_rules! lsp_debug {
  ($($arg:tt)+) => (
    log::debug!(target: "ts_gateway::lsp", $($arg)+)
  )
}

pub(crate) use lsp_debug;
pub(crate) use lsp_log;
pub(crate) use lsp_warn;
