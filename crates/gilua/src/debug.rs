//! Call-frame introspection through the interpreter's debug API.

use std::{
    ffi::{CStr, c_char},
    marker::PhantomData,
    mem,
};

use crate::{ffi, state::State, types::HookEvent};

/// Name of the function running in a frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugName {
    /// Name the function was called by, empty when unknown.
    pub name: String,
    /// `global`, `local`, `method`, `field`, `upvalue`, or empty.
    pub what: String,
}

/// Where the function of a frame was defined.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugSource {
    /// `Lua`, `C`, or `main`.
    pub what: String,
    /// Chunk name the function was loaded with.
    pub source: String,
    /// Length of `source`.
    pub len: usize,
    /// First line of the definition.
    pub line_defined: i32,
    /// Last line of the definition.
    pub last_line_defined: i32,
    /// Printable form of `source`, as used in messages.
    pub short_src: String,
}

/// Upvalue and parameter counts of the function of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugUpvalues {
    /// Number of upvalues.
    pub nups: u8,
    /// Number of fixed parameters.
    pub nparams: u8,
    /// Whether the function is variadic.
    pub is_vararg: bool,
}

/// Values transferred by the call or return of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugTransfer {
    /// Index of the first transferred value.
    pub first: u16,
    /// Number of transferred values.
    pub count: u16,
}

enum Record<'a> {
    Owned(Box<ffi::lua_Debug>),
    Borrowed(*mut ffi::lua_Debug, PhantomData<&'a mut ffi::lua_Debug>),
}

/// One activation record.
///
/// A `Debug` is only meaningful while the frame it describes is on the
/// stack; hooks receive one that lives for the hook invocation, and
/// [`State::get_stack`] returns one that borrows the state. Every accessor
/// queries the interpreter again.
pub struct Debug<'a> {
    /// Event that fired the hook; `None` outside hooks.
    pub event: Option<HookEvent>,
    raw: *mut ffi::lua_State,
    record: Record<'a>,
}

impl<'a> Debug<'a> {
    /// Wrap the record handed to a hook.
    pub(crate) unsafe fn from_hook(raw: *mut ffi::lua_State, ar: *mut ffi::lua_Debug) -> Self {
        let event = unsafe { (*ar).event };
        Self {
            event: Some(HookEvent::from_raw(event)),
            raw,
            record: Record::Borrowed(ar, PhantomData),
        }
    }

    fn ar(&mut self) -> *mut ffi::lua_Debug {
        match &mut self.record {
            Record::Owned(ar) => &mut **ar,
            Record::Borrowed(ar, _) => *ar,
        }
    }

    fn info(&mut self, what: &CStr) -> ffi::lua_Debug {
        let ar = self.ar();
        unsafe {
            ffi::lua_getinfo(self.raw, what.as_ptr(), ar);
            ar.read()
        }
    }

    /// Name of the function, via `getinfo("n")`.
    pub fn name(&mut self) -> DebugName {
        let ar = self.info(c"n");
        DebugName {
            name: c_string(ar.name),
            what: c_string(ar.namewhat),
        }
    }

    /// Definition site, via `getinfo("S")`.
    pub fn source(&mut self) -> DebugSource {
        let ar = self.info(c"S");
        DebugSource {
            what: c_string(ar.what),
            source: c_string(ar.source),
            len: ar.srclen,
            line_defined: ar.linedefined,
            last_line_defined: ar.lastlinedefined,
            short_src: c_string(ar.short_src.as_ptr()),
        }
    }

    /// Line being executed, or -1 when unavailable, via `getinfo("l")`.
    pub fn current_line(&mut self) -> i32 {
        self.info(c"l").currentline
    }

    /// Upvalue and parameter counts, via `getinfo("u")`.
    pub fn upvalues(&mut self) -> DebugUpvalues {
        let ar = self.info(c"u");
        DebugUpvalues {
            nups: ar.nups,
            nparams: ar.nparams,
            is_vararg: ar.isvararg != 0,
        }
    }

    /// Whether the frame was entered by a tail call, via `getinfo("t")`.
    pub fn is_tail_call(&mut self) -> bool {
        self.info(c"t").istailcall != 0
    }

    /// Transferred values of a call or return event, via `getinfo("r")`.
    pub fn transfer(&mut self) -> DebugTransfer {
        let ar = self.info(c"r");
        DebugTransfer {
            first: ar.ftransfer,
            count: ar.ntransfer,
        }
    }
}

impl State {
    /// The frame `level` levels up the call stack: 0 is the running function,
    /// 1 its caller, and so on. `None` past the bottom of the stack.
    pub fn get_stack(&mut self, level: i32) -> Option<Debug<'_>> {
        // SAFETY: lua_Debug is plain data; all-zero is a valid blank record.
        let mut ar: Box<ffi::lua_Debug> = Box::new(unsafe { mem::zeroed() });
        let found = unsafe { ffi::lua_getstack(self.raw(), level, &mut *ar) != 0 };
        found.then(|| Debug {
            event: None,
            raw: self.raw(),
            record: Record::Owned(ar),
        })
    }
}

fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}
