//! Native entry points: the closure trampoline, the `__gc` collectors that
//! release store entries, and the error objects that carry host errors
//! through the interpreter.

use std::{
    any::Any,
    ffi::{CStr, c_int},
    mem,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use crate::{
    error::{Error, ErrorKind, Result},
    ffi,
    state::State,
    store::{ERRORS, FUNCTIONS, Handle, HandleKind, USERDATA},
    types::Type,
};

/// A host function callable from scripts.
///
/// It receives the running thread with its arguments at indices `1..=n`,
/// pushes its results and returns how many there are. Returning `Err` raises
/// the error in the script.
pub type HostFunction = Arc<dyn Fn(&mut State) -> Result<usize> + Send + Sync>;

pub(crate) const USERDATA_META: &CStr = c"gilua.userdata";
const FUNCTION_META: &CStr = c"gilua.function";
const ERROR_META: &CStr = c"gilua.error";

pub(crate) const USERDATA_TAG: u64 = 0x6769_6c75_612e_7564;
const FUNCTION_TAG: u64 = 0x6769_6c75_612e_666e;
const ERROR_TAG: u64 = 0x6769_6c75_612e_6572;

/// Payload of every userdata created by this crate. Only the handle crosses
/// into the interpreter; the tag tells the kinds apart.
#[repr(C)]
#[derive(Clone, Copy)]
struct Slot {
    tag: u64,
    handle: u64,
}

impl State {
    /// Push a host function as a native closure.
    ///
    /// The closure's single upvalue is a userdata holding the function's
    /// handle; when the closure is collected that upvalue's `__gc` drops the
    /// function from the store.
    pub fn push_function<F>(&mut self, f: F) -> Handle
    where
        F: Fn(&mut State) -> Result<usize> + Send + Sync + 'static,
    {
        self.push_host_function(Arc::new(f))
    }

    /// Push an already shared host function.
    pub fn push_host_function(&mut self, f: HostFunction) -> Handle {
        let handle = FUNCTIONS.push(f);
        unsafe {
            push_slot(self.raw(), FUNCTION_TAG, handle);
            push_kind_metatable(self.raw(), FUNCTION_META, collect_function, None);
            ffi::lua_setmetatable(self.raw(), -2);
            ffi::lua_pushcclosure(self.raw(), call_function, 1);
        }
        handle
    }
}

const fn upvalue_index(i: c_int) -> c_int {
    ffi::LUA_REGISTRYINDEX - i
}

pub(crate) unsafe fn push_slot(raw: *mut ffi::lua_State, tag: u64, handle: Handle) {
    unsafe {
        let ptr = ffi::lua_newuserdatauv(raw, mem::size_of::<Slot>(), 0).cast::<Slot>();
        ptr.write(Slot {
            tag,
            handle: handle.id,
        });
    }
}

pub(crate) unsafe fn read_slot(raw: *mut ffi::lua_State, index: c_int, tag: u64) -> Option<Handle> {
    unsafe {
        if ffi::lua_type(raw, index) != ffi::LUA_TUSERDATA
            || ffi::lua_rawlen(raw, index) as usize != mem::size_of::<Slot>()
        {
            return None;
        }
        let ptr = ffi::lua_touserdata(raw, index).cast::<Slot>();
        if ptr.is_null() {
            return None;
        }
        let slot = ptr.read();
        (slot.tag == tag).then(|| Handle {
            kind: tag_kind(tag),
            id: slot.handle,
        })
    }
}

fn tag_kind(tag: u64) -> HandleKind {
    match tag {
        FUNCTION_TAG => HandleKind::Function,
        USERDATA_TAG => HandleKind::Userdata,
        ERROR_TAG => HandleKind::Error,
        _ => HandleKind::Other,
    }
}

/// Push the shared metatable of one of the crate's userdata kinds.
pub(crate) unsafe fn push_kind_metatable(
    raw: *mut ffi::lua_State,
    name: &CStr,
    gc: ffi::lua_CFunction,
    tostring: Option<ffi::lua_CFunction>,
) {
    unsafe {
        if ffi::luaL_newmetatable(raw, name.as_ptr()) != 0 {
            ffi::lua_pushcclosure(raw, gc, 0);
            ffi::lua_setfield(raw, -2, c"__gc".as_ptr());
            if let Some(tostring) = tostring {
                ffi::lua_pushcclosure(raw, tostring, 0);
                ffi::lua_setfield(raw, -2, c"__tostring".as_ptr());
            }
        }
    }
}

pub(crate) unsafe extern "C-unwind" fn call_function(raw: *mut ffi::lua_State) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { invoke(raw) }));
    let error = match outcome {
        Ok(Ok(nret)) => return nret,
        Ok(Err(err)) => err,
        Err(payload) => {
            let message = format!("host function panicked: {}", panic_message(payload.as_ref()));
            let mut state = unsafe { State::borrowed(raw) };
            state.error(1, Error::runtime(message))
        }
    };
    unsafe { raise(raw, error) }
}

unsafe fn invoke(raw: *mut ffi::lua_State) -> Result<c_int> {
    let mut state = unsafe { State::borrowed(raw) };
    let Some(handle) = (unsafe { read_slot(raw, upvalue_index(1), FUNCTION_TAG) }) else {
        return Err(state.error(1, Error::runtime("host function upvalue is missing")));
    };
    let Some(f) = FUNCTIONS.get(handle) else {
        return Err(state.error(1, Error::runtime("host function has been collected")));
    };

    let nret = f(&mut state).map_err(|err| state.error(1, err))?;
    let top = state.get_top();
    match c_int::try_from(nret) {
        Ok(n) if n <= top => Ok(n),
        _ => Err(state.error(
            1,
            Error::runtime(format!(
                "host function returned {nret} results with {top} values on the stack"
            )),
        )),
    }
}

/// Raise `error` in the interpreter. Nothing with a destructor may be alive
/// in the calling frame.
pub(crate) unsafe fn raise(raw: *mut ffi::lua_State, error: Error) -> ! {
    unsafe {
        push_error(raw, error);
        ffi::lua_error(raw)
    }
}

/// Push `error` as an error object that scripts can print and rethrow.
pub(crate) unsafe fn push_error(raw: *mut ffi::lua_State, error: Error) {
    let handle = ERRORS.push(error);
    unsafe {
        push_slot(raw, ERROR_TAG, handle);
        push_kind_metatable(raw, ERROR_META, collect_error, Some(error_to_string));
        ffi::lua_setmetatable(raw, -2);
    }
}

/// Pop the error object on top of `raw` and convert it.
pub(crate) unsafe fn take_error(raw: *mut ffi::lua_State, kind: ErrorKind) -> Error {
    let mut state = unsafe { State::borrowed(raw) };
    let error = match unsafe { read_slot(raw, -1, ERROR_TAG) } {
        Some(handle) => ERRORS
            .get(handle)
            .unwrap_or_else(|| Error::new(kind, "error object has been collected")),
        None => match state.type_of(-1) {
            Type::String | Type::Number => Error::new(kind, state.to_string(-1)),
            other => Error::new(kind, format!("(error object is a {other} value)")),
        },
    };
    state.pop(1);
    error
}

/// Message handler used by [`State::call`]: turns a raw error message into a
/// traced error object while the failing frames are still on the stack.
pub(crate) unsafe extern "C-unwind" fn message_handler(raw: *mut ffi::lua_State) -> c_int {
    let _ = catch_unwind(AssertUnwindSafe(|| unsafe { annotate(raw) }));
    1
}

unsafe fn annotate(raw: *mut ffi::lua_State) {
    let mut state = unsafe { State::borrowed(raw) };
    if !matches!(state.type_of(-1), Type::String | Type::Number) {
        return;
    }

    let message = state.to_string(-1);
    let located = state.locate_message(&message);
    let traceback = state.traceback(located.level);
    let error = Error::traced(
        Error::runtime(located.message),
        located.chunk_name,
        located.line,
        traceback,
    );

    state.pop(1);
    unsafe { push_error(raw, error) };
}

unsafe extern "C-unwind" fn error_to_string(raw: *mut ffi::lua_State) -> c_int {
    let text = match unsafe { read_slot(raw, 1, ERROR_TAG) }.and_then(|h| ERRORS.get(h)) {
        Some(error) => error.one_line(),
        None => "error object has been collected".to_string(),
    };
    let mut state = unsafe { State::borrowed(raw) };
    state.push_string(text);
    1
}

unsafe extern "C-unwind" fn collect_function(raw: *mut ffi::lua_State) -> c_int {
    if let Some(handle) = unsafe { read_slot(raw, 1, FUNCTION_TAG) } {
        let _ = catch_unwind(AssertUnwindSafe(|| drop(FUNCTIONS.pop(handle))));
    }
    0
}

pub(crate) unsafe extern "C-unwind" fn collect_userdata(raw: *mut ffi::lua_State) -> c_int {
    if let Some(handle) = unsafe { read_slot(raw, 1, USERDATA_TAG) } {
        let _ = catch_unwind(AssertUnwindSafe(|| drop(USERDATA.pop(handle))));
    }
    0
}

unsafe extern "C-unwind" fn collect_error(raw: *mut ffi::lua_State) -> c_int {
    if let Some(handle) = unsafe { read_slot(raw, 1, ERROR_TAG) } {
        let _ = catch_unwind(AssertUnwindSafe(|| drop(ERRORS.pop(handle))));
    }
    0
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    }
}
