// Copyright 2018-2025 the Deno authors. MIT license.

//! Handle and request lifecycle for driving a libuv-style event loop from a
//! scripting runtime.
//!
//! Runtime callbacks are stored in a [`CallbackRegistry`] and referenced by
//! token from native state. Handles are reference-counted wrappers whose
//! lifetime is decoupled from the native handle: closing is asynchronous and
//! no callback of a handle runs once it has been closed.

pub mod arena;
pub mod error;
mod event_loop;
mod handle;
mod native;
mod process_options;
mod registry;
mod request;
mod value;

pub use crate::arena::BufferArena;
pub use crate::arena::DEFAULT_BUFFER_SIZE;
pub use crate::arena::ReadBuffer;
pub use crate::error::CallbackError;
pub use crate::error::ErrorDomain;
pub use crate::error::ErrorMode;
pub use crate::error::LoopError;
pub use crate::error::UvError;
pub use crate::error::err_name;
pub use crate::error::strerror;
pub use crate::event_loop::EventLoopPhase;
pub use crate::event_loop::Loop;
pub use crate::event_loop::LoopFlags;
pub use crate::event_loop::LoopOptions;
pub use crate::event_loop::RunMode;
pub use crate::event_loop::RunStatus;
pub use crate::event_loop::default_loop;
pub use crate::handle::FsEvent;
pub use crate::handle::Handle;
pub use crate::handle::HandleFlags;
pub use crate::handle::HandleKind;
pub use crate::handle::HandleState;
pub use crate::handle::Idle;
pub use crate::handle::Process;
pub use crate::handle::SocketAddress;
pub use crate::handle::Tcp;
pub use crate::handle::Timer;
pub use crate::handle::kill;
pub use crate::native::ChildPipe;
pub use crate::native::NativeId;
pub use crate::native::UV_CHANGE;
pub use crate::native::UV_FS_EVENT_RECURSIVE;
pub use crate::native::UV_FS_EVENT_STAT;
pub use crate::native::UV_FS_EVENT_WATCH_ENTRY;
pub use crate::native::UV_RENAME;
pub use crate::process_options::ProcessFlags;
pub use crate::process_options::ProcessOptions;
pub use crate::process_options::StdioBinding;
pub use crate::registry::Callback;
pub use crate::registry::CallbackRegistry;
pub use crate::registry::CallbackToken;
pub use crate::registry::callback;
pub use crate::request::RequestId;
pub use crate::request::RequestKind;
pub use crate::value::Value;
