// Copyright 2025 the ts-gateway authors. MIT license.

pub mod installer;
pub mod registry;
