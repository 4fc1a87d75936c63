// Copyright 2018-2025 the Deno authors. MIT license.
use super::setup;
use super::this;
use crate::error::UvError;
use crate::event_loop::RunMode;
use crate::event_loop::RunStatus;
use crate::handle::Idle;
use pretty_assertions::assert_eq;
use std::cell::Cell;
use std::rc::Rc;

#[test]
fn test_idle_runs_every_iteration() {
  let event_loop = setup();
  let idle = Idle::new(&event_loop).unwrap();
  let hits = Rc::new(Cell::new(0));
  let hits_ = hits.clone();
  idle
    .start(move |args| {
      hits_.set(hits_.get() + 1);
      if hits_.get() == 5 {
        Idle::try_from(this(args))?.stop()?;
      }
      Ok(())
    })
    .unwrap();
  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(hits.get(), 5);
}

#[test]
fn test_idle_stopped_by_earlier_idle_does_not_run() {
  let event_loop = setup();
  let first = Idle::new(&event_loop).unwrap();
  let second = Idle::new(&event_loop).unwrap();
  let second_hits = Rc::new(Cell::new(0));
  let second_ = second.clone();
  first
    .start(move |args| {
      second_.stop()?;
      Idle::try_from(this(args))?.stop()?;
      Ok(())
    })
    .unwrap();
  let hits = second_hits.clone();
  second
    .start(move |_| {
      hits.set(hits.get() + 1);
      Ok(())
    })
    .unwrap();
  event_loop.run(RunMode::Default).unwrap();
  assert_eq!(second_hits.get(), 0);
  first.close().unwrap();
  second.close().unwrap();
  event_loop.run(RunMode::Default).unwrap();
  assert_eq!(event_loop.callback_count(), 0);
}

#[test]
fn test_start_after_close_is_refused() {
  let event_loop = setup();
  let idle = Idle::new(&event_loop).unwrap();
  idle.close().unwrap();
  assert_eq!(idle.start(|_| Ok(())), Err(UvError::ResourceClosed));
  assert_eq!(idle.close(), Err(UvError::ResourceClosed));
  assert_eq!(event_loop.callback_count(), 0);
  event_loop.run(RunMode::Default).unwrap();
  assert_eq!(event_loop.handle_count(), 0);
}
