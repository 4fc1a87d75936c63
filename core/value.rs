// Copyright 2018-2025 the Deno authors. MIT license.

use crate::error::UvError;
use crate::handle::Handle;
use bytes::Bytes;

/// A callback argument as seen by the runtime.
#[derive(Debug, Clone)]
pub enum Value {
  Nil,
  Bool(bool),
  Integer(i64),
  String(String),
  Bytes(Bytes),
  Handle(Handle),
  Error(UvError),
}

impl Value {
  pub fn is_nil(&self) -> bool {
    matches!(self, Value::Nil)
  }

  pub fn as_handle(&self) -> Option<&Handle> {
    match self {
      Value::Handle(handle) => Some(handle),
      _ => None,
    }
  }

  pub fn as_error(&self) -> Option<&UvError> {
    match self {
      Value::Error(err) => Some(err),
      _ => None,
    }
  }

  pub fn as_integer(&self) -> Option<i64> {
    match self {
      Value::Integer(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bytes(&self) -> Option<&Bytes> {
    match self {
      Value::Bytes(b) => Some(b),
      _ => None,
    }
  }
}

impl From<Option<UvError>> for Value {
  fn from(err: Option<UvError>) -> Self {
    err.map(Value::Error).unwrap_or(Value::Nil)
  }
}

impl From<Option<Handle>> for Value {
  fn from(handle: Option<Handle>) -> Self {
    handle.map(Value::Handle).unwrap_or(Value::Nil)
  }
}
