// Copyright 2018-2025 the Deno authors. MIT license.
use super::Recorder;
use super::setup;
use super::this;
use crate::error::UV_EINVAL;
use crate::event_loop::RunMode;
use crate::event_loop::RunStatus;
use crate::handle::Timer;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;

#[test]
fn test_repeating_timer_stops_itself() {
  let event_loop = setup();
  let timer = Timer::new(&event_loop).unwrap();
  let hits = Rc::new(Cell::new(0));
  let hits_ = hits.clone();
  timer
    .start(1, 1, move |args| {
      hits_.set(hits_.get() + 1);
      if hits_.get() == 3 {
        Timer::try_from(this(args))?.stop()?;
      }
      Ok(())
    })
    .unwrap();
  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(hits.get(), 3);
  assert!(!timer.is_active().unwrap());

  // Nothing fires after stop, even when the loop runs again.
  assert_eq!(event_loop.run(RunMode::NoWait), Ok(RunStatus::Drained));
  assert_eq!(hits.get(), 3);
}

#[test]
fn test_stopped_timer_never_fires() {
  let event_loop = setup();
  let timer = Timer::new(&event_loop).unwrap();
  let hits = Rc::new(Cell::new(0));
  let hits_ = hits.clone();
  timer
    .start(0, 0, move |_| {
      hits_.set(hits_.get() + 1);
      Ok(())
    })
    .unwrap();
  timer.stop().unwrap();
  timer.stop().unwrap();
  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(hits.get(), 0);
  assert!(timer.is_open());
}

#[test]
fn test_timers_fire_in_deadline_order() {
  let event_loop = setup();
  let order = Recorder::default();
  let slow = Timer::new(&event_loop).unwrap();
  let fast = Timer::new(&event_loop).unwrap();
  let order_ = order.clone();
  slow
    .start(20, 0, move |_| {
      order_.push("slow");
      Ok(())
    })
    .unwrap();
  let order_ = order.clone();
  fast
    .start(1, 0, move |_| {
      order_.push("fast");
      Ok(())
    })
    .unwrap();
  event_loop.run(RunMode::Default).unwrap();
  assert_eq!(order.get(), vec!["fast", "slow"]);
}

#[rstest]
#[case(RunMode::Default)]
#[case(RunMode::Once)]
fn test_loop_sleeps_until_timer_is_due(#[case] mode: RunMode) {
  let event_loop = setup();
  let timer = Timer::new(&event_loop).unwrap();
  let started = event_loop.now();
  let fired_at = Rc::new(Cell::new(None));
  let fired_at_ = fired_at.clone();
  timer
    .start(20, 0, move |args| {
      fired_at_.set(Some(this(args).event_loop().now()));
      Ok(())
    })
    .unwrap();
  let wall = Instant::now();
  assert_eq!(event_loop.run(mode), Ok(RunStatus::Drained));
  let fired_at = fired_at.get().expect("timer did not fire");
  assert!(fired_at >= started + 20);
  assert!(wall.elapsed() >= Duration::from_millis(19));
}

#[test]
fn test_timer_rearmed_in_callback_waits_for_next_iteration() {
  let event_loop = setup();
  let timer = Timer::new(&event_loop).unwrap();
  let hits = Rc::new(Cell::new(0));
  let hits_ = hits.clone();
  timer
    .start(0, 0, move |args| {
      hits_.set(hits_.get() + 1);
      let hits = hits_.clone();
      Timer::try_from(this(args))?.start(0, 0, move |_| {
        hits.set(hits.get() + 1);
        Ok(())
      })?;
      Ok(())
    })
    .unwrap();
  assert_eq!(event_loop.run(RunMode::NoWait), Ok(RunStatus::Alive));
  assert_eq!(hits.get(), 1);
  assert_eq!(event_loop.run(RunMode::NoWait), Ok(RunStatus::Drained));
  assert_eq!(hits.get(), 2);
}

#[test]
fn test_again_and_repeat() {
  let event_loop = setup();
  let timer = Timer::new(&event_loop).unwrap();
  assert_eq!(timer.again().unwrap_err().code(), UV_EINVAL);

  timer.start(1000, 0, |_| Ok(())).unwrap();
  assert_eq!(timer.again().unwrap_err().code(), UV_EINVAL);

  timer.set_repeat(5).unwrap();
  assert_eq!(timer.repeat().unwrap(), 5);
  timer.again().unwrap();
  assert!(timer.is_active().unwrap());

  timer.close().unwrap();
  assert!(timer.again().is_err());
  event_loop.run(RunMode::Default).unwrap();
}

#[test]
fn test_close_callback_gets_handle() {
  let event_loop = setup();
  let timer = Timer::new(&event_loop).unwrap();
  timer.start(0, 1, |_| panic!("closed timer fired")).unwrap();
  let closed = Recorder::default();
  let closed_ = closed.clone();
  timer
    .close_with(move |args| {
      closed_.push(this(args).kind());
      Ok(())
    })
    .unwrap();
  assert!(timer.is_closing());
  assert!(!timer.is_open());
  assert_eq!(event_loop.run(RunMode::Default), Ok(RunStatus::Drained));
  assert_eq!(closed.get(), vec![crate::handle::HandleKind::Timer]);
  assert_eq!(event_loop.handle_count(), 0);
  assert_eq!(event_loop.callback_count(), 0);
}
