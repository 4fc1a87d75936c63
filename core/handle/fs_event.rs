// Copyright 2018-2025 the Deno authors. MIT license.
use super::CallbackSlot;
use super::Handle;
use super::HandleKind;
use crate::error::CallbackError;
use crate::error::UvError;
use crate::event_loop::Loop;
use crate::value::Value;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

/// Watches a file or directory for changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent(Handle);

impl FsEvent {
  pub fn new(event_loop: &Loop) -> Result<FsEvent, UvError> {
    Handle::create(event_loop, HandleKind::FsEvent)?
      .init(|native, id| native.fs_event_init(id))
      .map(FsEvent)
  }

  /// Starts watching `path`. `callback` receives
  /// `(handle, err, filename, events)` where `events` is a mask of
  /// [`crate::UV_RENAME`] and [`crate::UV_CHANGE`].
  pub fn start(
    &self,
    path: impl AsRef<Path>,
    flags: u32,
    callback: impl Fn(&[Value]) -> Result<(), CallbackError> + 'static,
  ) -> Result<(), UvError> {
    let path = path.as_ref();
    self
      .0
      .start(CallbackSlot::Start, Rc::new(callback), |native, id| {
        native.fs_event_start(id, path, flags)
      })
      .map_err(|err| match err {
        UvError::Native { code, .. } => {
          UvError::native_with_context(code, path.display())
        }
        other => other,
      })
  }

  pub fn stop(&self) -> Result<(), UvError> {
    self.0.native_call(|native, id| native.fs_event_stop(id))
  }

  /// The watched path. Fails with `EINVAL` when the watcher is not started.
  pub fn path(&self) -> Result<PathBuf, UvError> {
    self
      .0
      .native_query(|native, id| native.fs_event_path(id))?
      .map_err(UvError::native)
  }
}

impl Deref for FsEvent {
  type Target = Handle;

  fn deref(&self) -> &Handle {
    &self.0
  }
}

impl From<FsEvent> for Handle {
  fn from(fs_event: FsEvent) -> Handle {
    fs_event.0
  }
}

impl TryFrom<Handle> for FsEvent {
  type Error = UvError;

  fn try_from(handle: Handle) -> Result<Self, Self::Error> {
    match handle.kind() {
      HandleKind::FsEvent => Ok(FsEvent(handle)),
      kind => {
        Err(UvError::argument(format!("fs_event expected, got {kind}")))
      }
    }
  }
}
