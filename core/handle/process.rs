// Copyright 2018-2025 the Deno authors. MIT license.
use super::CallbackSlot;
use super::Handle;
use super::HandleKind;
use crate::error::UvError;
use crate::error::check_status;
use crate::event_loop::Loop;
use crate::native::ChildPipe;
use crate::native::SpawnSpec;
use crate::native::StdioTarget;
use crate::native::kill_pid;
use crate::process_options::ProcessOptions;
use crate::process_options::StdioBinding;
use crate::registry::Callback;
use std::ops::Deref;

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;

/// A spawned child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process(Handle);

/// Turns the stdio bindings into native targets, looking up the sockets of
/// inherited streams.
fn resolve_stdio(
  event_loop: &Loop,
  stdio: &[StdioBinding],
) -> Result<Vec<StdioTarget>, UvError> {
  let mut targets = Vec::with_capacity(stdio.len());
  for (index, binding) in stdio.iter().enumerate() {
    let target = match binding {
      StdioBinding::Ignore => StdioTarget::Ignore,
      StdioBinding::InheritFd(fd) if *fd as usize == index => {
        StdioTarget::Inherit
      }
      StdioBinding::InheritFd(fd) => StdioTarget::Fd(*fd),
      StdioBinding::CreatePipe { readable, writable } => StdioTarget::Pipe {
        readable: *readable,
        writable: *writable,
      },
      StdioBinding::InheritStream(handle) => {
        stream_target(event_loop, handle)?
      }
    };
    targets.push(target);
  }
  Ok(targets)
}

#[cfg(unix)]
fn stream_target(
  event_loop: &Loop,
  handle: &Handle,
) -> Result<StdioTarget, UvError> {
  handle.check_open()?;
  let id = handle.id();
  event_loop
    .with_native(|native| native.tcp_raw_fd(id))
    .map(StdioTarget::Fd)
    .ok_or_else(|| UvError::native(crate::error::UV_ENOTCONN))
}

#[cfg(not(unix))]
fn stream_target(
  _event_loop: &Loop,
  _handle: &Handle,
) -> Result<StdioTarget, UvError> {
  Err(UvError::native(crate::error::UV_ENOTSUP))
}

impl Process {
  /// Spawns a child. `on_exit` receives `(handle, exit_status, term_signal)`
  /// once the child exits. Returns the handle together with the child's pid.
  pub fn spawn(
    event_loop: &Loop,
    options: &ProcessOptions,
    on_exit: Option<Callback>,
  ) -> Result<(Process, u32), UvError> {
    options.validate()?;
    let flags = options.effective_flags();
    let spec = SpawnSpec {
      file: options.file.clone(),
      argv: options.argv(),
      env: options.env_pairs(),
      cwd: options.cwd.clone(),
      uid: options.uid.filter(|_| flags.setuid),
      gid: options.gid.filter(|_| flags.setgid),
      detached: flags.detached,
      stdio: resolve_stdio(event_loop, &options.stdio)?,
    };
    let _guard = event_loop.enter();
    let handle = Handle::create(event_loop, HandleKind::Process)?
      .init(|native, id| native.process_spawn(id, &spec))?;
    if flags.detached {
      handle.set_noclose(true);
    }
    if let Some(on_exit) = on_exit {
      handle.set_callback(CallbackSlot::Start, on_exit);
    }
    let pid = handle
      .native_query(|native, id| native.process_pid(id))?
      .unwrap_or_default();
    log::debug!("spawned {} as pid {pid}", options.file);
    Ok((Process(handle), pid))
  }

  pub fn pid(&self) -> Result<u32, UvError> {
    self
      .0
      .native_query(|native, id| native.process_pid(id))?
      .ok_or(UvError::ResourceClosed)
  }

  /// Sends `signum` to the child, `SIGTERM` when `None`.
  pub fn kill(&self, signum: Option<i32>) -> Result<(), UvError> {
    let signum = signum.unwrap_or(SIGTERM);
    self.0.native_call(|native, id| native.process_kill(id, signum))
  }

  /// Takes the parent end of a pipe created for stdio entry `index`. Each
  /// pipe can be taken once.
  pub fn take_pipe(&self, index: usize) -> Result<Option<ChildPipe>, UvError> {
    self
      .0
      .native_query(|native, id| native.process_take_pipe(id, index))
  }
}

/// Sends `signum` (default `SIGTERM`) to an arbitrary process.
pub fn kill(pid: i32, signum: Option<i32>) -> Result<(), UvError> {
  check_status(kill_pid(pid, signum.unwrap_or(SIGTERM)))
}

impl Deref for Process {
  type Target = Handle;

  fn deref(&self) -> &Handle {
    &self.0
  }
}

impl From<Process> for Handle {
  fn from(process: Process) -> Handle {
    process.0
  }
}

impl TryFrom<Handle> for Process {
  type Error = UvError;

  fn try_from(handle: Handle) -> Result<Self, Self::Error> {
    match handle.kind() {
      HandleKind::Process => Ok(Process(handle)),
      kind => {
        Err(UvError::argument(format!("process expected, got {kind}")))
      }
    }
  }
}
