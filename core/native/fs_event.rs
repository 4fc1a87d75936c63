// Copyright 2018-2025 the Deno authors. MIT license.

// Filesystem watching is backed by `notify`. The watcher thread forwards raw
// events over a channel which the check phase drains and translates into
// rename/change masks.

use super::NativeId;
use super::NativeLoop;
use super::NativeObject;
use crate::error::UV_EINVAL;
use crate::error::UV_ENOENT;
use crate::error::status_from_io;
use crate::handle::HandleKind;
use notify::Config;
use notify::Event;
use notify::EventHandler;
use notify::EventKind;
use notify::PollWatcher;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use notify::event::ModifyKind;
use std::path::Path;
use std::path::PathBuf;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::mpsc;

/// Event bits passed to the watcher callback.
pub const UV_RENAME: i32 = 1;
pub const UV_CHANGE: i32 = 2;

/// Flags accepted by the watcher start operation.
pub const UV_FS_EVENT_WATCH_ENTRY: u32 = 1;
pub const UV_FS_EVENT_STAT: u32 = 2;
pub const UV_FS_EVENT_RECURSIVE: u32 = 4;

struct Watch {
  /// The path as given to start.
  path: PathBuf,
  /// `path` canonicalized, which is what the backend reports events under.
  root: PathBuf,
  is_dir: bool,
  // Dropping the watcher stops its thread and closes the channel.
  _watcher: Box<dyn Watcher>,
  events: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

#[derive(Default)]
pub(crate) struct FsEventState(Option<Watch>);

/// One change observed by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FsChange {
  pub(crate) id: NativeId,
  pub(crate) filename: Option<String>,
  pub(crate) events: i32,
  pub(crate) status: i32,
}

fn event_mask(kind: &EventKind) -> i32 {
  match kind {
    EventKind::Create(_)
    | EventKind::Remove(_)
    | EventKind::Modify(ModifyKind::Name(_)) => UV_RENAME,
    EventKind::Modify(_) | EventKind::Any => UV_CHANGE,
    EventKind::Access(_) | EventKind::Other => 0,
  }
}

fn status_from_notify(err: &notify::Error) -> i32 {
  match &err.kind {
    notify::ErrorKind::Io(err) => status_from_io(err),
    notify::ErrorKind::PathNotFound => UV_ENOENT,
    _ => UV_EINVAL,
  }
}

fn basename(path: &Path) -> Option<String> {
  path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
}

/// `UV_FS_EVENT_STAT` asks for stat polling instead of the platform
/// notification backend.
fn new_watcher(
  handler: impl EventHandler,
  flags: u32,
  poll_interval: Duration,
) -> notify::Result<Box<dyn Watcher>> {
  if flags & UV_FS_EVENT_STAT != 0 {
    let config = Config::default().with_poll_interval(poll_interval);
    Ok(Box::new(PollWatcher::new(handler, config)?))
  } else {
    Ok(Box::new(RecommendedWatcher::new(handler, Config::default())?))
  }
}

impl Watch {
  /// Names an event path the way the callback reports it: relative to a
  /// watched directory, or the basename of a watched file.
  fn filename(&self, path: &Path) -> Option<String> {
    if !self.is_dir {
      return basename(&self.path);
    }
    path
      .strip_prefix(&self.root)
      .or_else(|_| path.strip_prefix(&self.path))
      .ok()
      .filter(|rel| !rel.as_os_str().is_empty())
      .map(|rel| rel.to_string_lossy().into_owned())
      .or_else(|| basename(&self.path))
  }

  fn translate(
    &self,
    id: NativeId,
    result: notify::Result<Event>,
    out: &mut Vec<FsChange>,
  ) {
    let event = match result {
      Ok(event) => event,
      Err(err) => {
        log::debug!("watcher {} failed: {err}", id.as_raw());
        out.push(FsChange {
          id,
          filename: None,
          events: 0,
          status: status_from_notify(&err),
        });
        return;
      }
    };
    let events = event_mask(&event.kind);
    if events == 0 {
      return;
    }
    if event.paths.is_empty() {
      out.push(FsChange {
        id,
        filename: basename(&self.path),
        events,
        status: 0,
      });
    }
    for path in &event.paths {
      out.push(FsChange {
        id,
        filename: self.filename(path),
        events,
        status: 0,
      });
    }
  }
}

impl NativeLoop {
  pub(crate) fn fs_event_init(&mut self, id: NativeId) -> i32 {
    self.init_object(
      id,
      HandleKind::FsEvent,
      NativeObject::FsEvent(FsEventState::default()),
    )
  }

  pub(crate) fn fs_event_start(
    &mut self,
    id: NativeId,
    path: &Path,
    flags: u32,
  ) -> i32 {
    let poll_interval = self.fs_poll_interval;
    let Some(slot) = self.slots.get_mut(&id).filter(|s| !s.closing) else {
      return UV_EINVAL;
    };
    let NativeObject::FsEvent(state) = &mut slot.object else {
      return UV_EINVAL;
    };
    if slot.active {
      return UV_EINVAL;
    }
    let meta = match std::fs::metadata(path) {
      Ok(meta) => meta,
      Err(err) => return status_from_io(&err),
    };
    let root = match std::fs::canonicalize(path) {
      Ok(root) => root,
      Err(err) => return status_from_io(&err),
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |res: notify::Result<Event>| {
      let _ = tx.send(res);
    };
    let mut watcher = match new_watcher(handler, flags, poll_interval) {
      Ok(watcher) => watcher,
      Err(err) => return status_from_notify(&err),
    };
    let mode = if flags & UV_FS_EVENT_RECURSIVE != 0 {
      RecursiveMode::Recursive
    } else {
      RecursiveMode::NonRecursive
    };
    if let Err(err) = watcher.watch(&root, mode) {
      return status_from_notify(&err);
    }
    state.0 = Some(Watch {
      path: path.to_path_buf(),
      root,
      is_dir: meta.is_dir(),
      _watcher: watcher,
      events: rx,
    });
    slot.active = true;
    self.waker.wake_by_ref();
    0
  }

  pub(crate) fn fs_event_stop(&mut self, id: NativeId) -> i32 {
    let Some(slot) = self.slots.get_mut(&id) else {
      return UV_EINVAL;
    };
    let NativeObject::FsEvent(state) = &mut slot.object else {
      return UV_EINVAL;
    };
    state.0 = None;
    slot.active = false;
    0
  }

  pub(crate) fn fs_event_path(&self, id: NativeId) -> Result<PathBuf, i32> {
    match self.slots.get(&id).map(|slot| (&slot.object, slot.active)) {
      Some((NativeObject::FsEvent(FsEventState(Some(watch))), true)) => {
        Ok(watch.path.clone())
      }
      _ => Err(UV_EINVAL),
    }
  }

  /// Drains whatever the watcher threads have delivered since the last
  /// check phase. Registers `cx` to be woken by the next delivery.
  pub(crate) fn poll_fs_events(&mut self, cx: &mut Context) -> Vec<FsChange> {
    let mut changes = Vec::new();
    for (id, slot) in self.slots.iter_mut() {
      if slot.closing || !slot.active {
        continue;
      }
      let NativeObject::FsEvent(FsEventState(Some(watch))) = &mut slot.object
      else {
        continue;
      };
      while let Poll::Ready(Some(result)) = watch.events.poll_recv(cx) {
        watch.translate(*id, result, &mut changes);
      }
    }
    changes
  }
}
