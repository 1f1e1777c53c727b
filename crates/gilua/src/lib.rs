//! # gilua
//!
//! A safe, stack-based binding to the Lua 5.4 interpreter.
//!
//! ## Overview
//!
//! [`State`] owns one interpreter and mirrors its C API: values live on a
//! stack addressed by 1-based indices from the bottom or negative indices
//! from the top. On top of the raw stack the crate provides:
//!
//! - **Value marshaling**: [`State::to_any`] / [`State::push_any`] convert
//!   between stack values and [`Value`].
//! - **Host closures and userdata**: host functions and opaque host values
//!   cross into the interpreter as integer [`Handle`]s into process-wide
//!   stores; the interpreter's collector releases them.
//! - **Errors with traces**: every failed call returns an [`Error`] with its
//!   [`ErrorKind`]; errors raised in scripts or host functions carry chunk
//!   name, line and traceback ([`Traced`]).
//! - **Cooperative cancellation**: [`State::call_with_context`] runs under a
//!   [`CancelContext`], polled by an instruction-count hook.
//!
//! ```no_run
//! use gilua::{State, MULTRET};
//!
//! # fn main() -> gilua::Result<()> {
//! let mut state = State::new()?;
//! state.push_function(|state: &mut State| {
//!     let name = state.check_string(1)?;
//!     state.push_string(format!("hello, {name}"));
//!     Ok(1)
//! });
//! state.set_global("greet")?;
//!
//! state.load_string("return greet('world')")?;
//! state.call(0, MULTRET)?;
//! assert_eq!(state.to_string(-1), "hello, world");
//! # Ok(())
//! # }
//! ```
//!
//! A `State` is not thread-safe. Sharing one between threads is the job of
//! the `gilua-env` crate.

/// Raw C bindings, for interoperating with other code that drives the
/// same interpreter.
pub use mlua_sys as ffi;

/// Error helpers: where, traceback, argument checks, field setters.
mod auxlib;
/// Cancellation contexts.
mod context;
/// Call-frame introspection.
mod debug;
/// Error types and Result alias.
mod error;
/// Closure trampoline and error objects.
mod function;
/// Hooks and cancellation.
mod hook;
/// Chunk loading.
mod load;
/// Stack/host value conversion.
mod marshal;
/// Script-level protected calls.
mod protect;
/// The interpreter state.
mod state;
/// Handle stores.
mod store;
/// Registry references and threads.
mod thread;
/// Type tags and hook masks.
mod types;
/// Host values.
mod value;

pub mod testutils;

pub use context::{CancelContext, DEFAULT_CHECK_INTERVAL};
pub use debug::{Debug, DebugName, DebugSource, DebugTransfer, DebugUpvalues};
pub use error::{CancelReason, Error, ErrorKind, Result, Traced};
pub use function::HostFunction;
pub use hook::HookFunction;
pub use load::STRING_CHUNK;
pub use marshal::MAX_DEPTH;
pub use state::{MULTRET, State};
pub use store::{Handle, HandleKind, Store, Userdata};
pub use thread::{RegistryRef, Thread};
pub use types::{HookEvent, HookMask, Type};
pub use value::{NumberMode, Value};
