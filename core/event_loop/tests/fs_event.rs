// Copyright 2018-2025 the Deno authors. MIT license.
use super::Recorder;
use super::this;
use super::watchdog;
use crate::error::UV_EINVAL;
use crate::error::UV_ENOENT;
use crate::error::UvError;
use crate::event_loop::Loop;
use crate::event_loop::LoopOptions;
use crate::event_loop::RunMode;
use crate::event_loop::RunStatus;
use crate::handle::FsEvent;
use crate::handle::Timer;
use crate::native::UV_FS_EVENT_RECURSIVE;
use crate::native::UV_FS_EVENT_STAT;
use crate::native::UV_RENAME;
use crate::value::Value;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn fast_loop() -> Loop {
  Loop::new(LoopOptions {
    fs_poll_interval: Duration::from_millis(5),
    ..Default::default()
  })
  .unwrap()
}

/// Runs `f` from a timer once the watcher has been set up.
fn later(
  event_loop: &Loop,
  f: impl Fn() -> std::io::Result<()> + 'static,
) -> Timer {
  let timer = Timer::new(event_loop).unwrap();
  timer
    .start(20, 0, move |_| {
      f().map_err(UvError::from)?;
      Ok(())
    })
    .unwrap();
  timer
}

/// Records `(filename, events)` and stops the watcher after `limit`
/// rename events.
fn record_renames(
  events: &Recorder<(Option<String>, i64)>,
  limit: usize,
) -> impl Fn(&[Value]) -> Result<(), crate::error::CallbackError> + 'static {
  let events = events.clone();
  move |args| {
    let filename = args[2].as_str().map(str::to_string);
    let mask = args[3].as_integer().unwrap_or_default();
    if mask == i64::from(UV_RENAME) {
      events.push((filename, mask));
    }
    if events.get().len() >= limit {
      FsEvent::try_from(this(args))?.stop()?;
    }
    Ok(())
  }
}

fn renamed(name: &str) -> (Option<String>, i64) {
  (Some(name.to_string()), i64::from(UV_RENAME))
}

#[rstest]
#[case::notify(0)]
#[case::stat(UV_FS_EVENT_STAT)]
fn test_watch_directory_sees_new_file(#[case] flags: u32) {
  let event_loop = fast_loop();
  let _watchdog = watchdog(&event_loop, 5_000);
  let dir = TempDir::new().unwrap();
  let watcher = FsEvent::new(&event_loop).unwrap();
  let events = Recorder::default();
  watcher
    .start(dir.path(), flags, record_renames(&events, 1))
    .unwrap();
  assert_eq!(watcher.path().unwrap(), dir.path());

  let file = dir.path().join("created.txt");
  let _timer = later(&event_loop, move || std::fs::write(&file, b"x"));

  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(events.get(), vec![renamed("created.txt")]);
  assert!(watcher.path().is_err());
}

#[test]
fn test_short_lived_file_is_reported() {
  let event_loop = fast_loop();
  let _watchdog = watchdog(&event_loop, 5_000);
  let dir = TempDir::new().unwrap();
  let watcher = FsEvent::new(&event_loop).unwrap();
  let events = Recorder::default();
  watcher
    .start(dir.path(), 0, record_renames(&events, 2))
    .unwrap();

  // Gone again before the loop looks at the watcher.
  let file = dir.path().join("blink.txt");
  let _timer = later(&event_loop, move || {
    std::fs::write(&file, b"x")?;
    std::fs::remove_file(&file)
  });

  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(
    events.get(),
    vec![renamed("blink.txt"), renamed("blink.txt")]
  );
}

#[test]
fn test_recursive_watch_names_nested_paths() {
  let event_loop = fast_loop();
  let _watchdog = watchdog(&event_loop, 5_000);
  let dir = TempDir::new().unwrap();
  std::fs::create_dir(dir.path().join("sub")).unwrap();
  let watcher = FsEvent::new(&event_loop).unwrap();
  let events = Recorder::default();
  watcher
    .start(dir.path(), UV_FS_EVENT_RECURSIVE, record_renames(&events, 1))
    .unwrap();

  let file = dir.path().join("sub").join("deep.txt");
  let _timer = later(&event_loop, move || std::fs::write(&file, b"x"));

  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  let expected = Path::new("sub").join("deep.txt");
  assert_eq!(events.get(), vec![renamed(&expected.to_string_lossy())]);
}

#[test]
fn test_failed_restart_keeps_running_watcher() {
  let event_loop = fast_loop();
  let _watchdog = watchdog(&event_loop, 5_000);
  let dir = TempDir::new().unwrap();
  let watcher = FsEvent::new(&event_loop).unwrap();
  let events = Recorder::default();
  watcher
    .start(dir.path(), 0, record_renames(&events, 1))
    .unwrap();
  let callbacks = event_loop.callback_count();

  let err = watcher
    .start(dir.path(), 0, |_: &[Value]| panic!("replacement must not fire"))
    .unwrap_err();
  assert_eq!(err.code(), UV_EINVAL);
  assert_eq!(event_loop.callback_count(), callbacks);
  assert!(watcher.is_active().unwrap());

  let file = dir.path().join("after.txt");
  let _timer = later(&event_loop, move || std::fs::write(&file, b"x"));
  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(events.get(), vec![renamed("after.txt")]);
}

#[test]
fn test_watch_missing_path_fails() {
  let event_loop = fast_loop();
  let watcher = FsEvent::new(&event_loop).unwrap();
  let dir = TempDir::new().unwrap();
  let missing: PathBuf = dir.path().join("nope");
  let err = watcher
    .start(&missing, 0, |_: &[Value]| panic!("must not fire"))
    .unwrap_err();
  assert_eq!(err.code(), UV_ENOENT);
  assert_eq!(err.context(), Some(missing.display().to_string().as_str()));
  assert!(watcher.is_open());
  assert_eq!(event_loop.callback_count(), 0);
}
