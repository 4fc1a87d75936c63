// Copyright 2018-2025 the Deno authors. MIT license.
mod buffer_arena;

pub use buffer_arena::*;
