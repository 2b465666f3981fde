// Copyright 2025 the ts-gateway authors. MIT license.

pub mod fs;
pub mod sync;
