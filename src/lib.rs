// Copyright 2025 the ts-gateway authors. MIT license.

pub mod archive;
pub mod client;
pub mod config;
pub mod errors;
pub mod language_server;
pub mod logging;
pub mod manifests;
pub mod npm;
pub mod package_json;
pub mod resources;
pub mod session;
pub mod sourcemaps;
pub mod tsconfig;
pub mod tsserver;
pub mod urls;
pub mod util;

pub use errors::AnyError;
pub use language_server::GatewayOptions;
pub use language_server::GatewayServer;
