//! The owned interpreter state and its stack primitives.
//!
//! Indices follow the interpreter's convention: positive indices count from
//! the bottom of the current frame starting at 1, negative indices count from
//! the top.

use std::{
    ffi::{CString, c_char, c_int},
    ptr::{self, NonNull},
    slice,
};

use crate::{
    error::{Error, ErrorKind, Result},
    ffi, function, hook, protect,
    types::Type,
};

/// Pass as `nret` to keep every result of a call.
pub const MULTRET: i32 = ffi::LUA_MULTRET;

/// A handle on an interpreter thread.
///
/// The value returned by [`State::new`] owns the interpreter and destroys it
/// when closed or dropped. Host functions and hooks receive borrowed views of
/// the running thread, which never close anything.
pub struct State {
    raw: NonNull<ffi::lua_State>,
    owned: bool,
}

impl State {
    /// Create a new interpreter with the standard libraries opened and the
    /// script-level `pcall`/`xpcall` replaced by host versions that keep host
    /// error kinds intact.
    pub fn new() -> Result<Self> {
        let raw = NonNull::new(unsafe { ffi::luaL_newstate() }).ok_or_else(|| {
            Error::new(ErrorKind::Memory, "cannot create state: not enough memory")
        })?;
        unsafe { ffi::luaL_openlibs(raw.as_ptr()) };

        let mut state = Self { raw, owned: true };
        state.push_function(protect::pcall);
        state.set_global("pcall")?;
        state.push_function(protect::xpcall);
        state.set_global("xpcall")?;

        tracing::debug!("created interpreter state {:p}", raw.as_ptr());
        Ok(state)
    }

    /// A non-owning view of `raw`.
    ///
    /// # Safety
    /// `raw` must be a live thread of a state that outlives the view.
    pub(crate) unsafe fn borrowed(raw: *mut ffi::lua_State) -> Self {
        Self {
            // SAFETY: the interpreter never hands out null thread pointers.
            raw: unsafe { NonNull::new_unchecked(raw) },
            owned: false,
        }
    }

    /// A non-owning view of the interpreter thread `raw`. Dropping the view
    /// leaves the interpreter open.
    ///
    /// # Safety
    /// `raw` must be a live thread whose interpreter outlives the view, and
    /// no other code may touch that interpreter while the view is in use.
    pub unsafe fn from_ptr(raw: *mut ffi::lua_State) -> Self {
        unsafe { Self::borrowed(raw) }
    }

    /// Destroy the interpreter. Every userdata and closure registered against
    /// it is finalized, so their handles look up as absent afterwards.
    pub fn close(self) {
        drop(self)
    }

    /// Raw pointer for interoperating with other bindings.
    pub fn as_ptr(&self) -> *mut ffi::lua_State {
        self.raw.as_ptr()
    }

    /// Whether this handle owns (and will close) the interpreter.
    pub fn is_owner(&self) -> bool {
        self.owned
    }

    pub(crate) fn raw(&self) -> *mut ffi::lua_State {
        self.raw.as_ptr()
    }

    /// Pointer of the main thread of this interpreter.
    pub(crate) fn main_thread(&self) -> *mut ffi::lua_State {
        unsafe { main_thread_of(self.raw()) }
    }

    // Stack management

    /// Index of the top element, which is also the number of elements.
    pub fn get_top(&self) -> i32 {
        unsafe { ffi::lua_gettop(self.raw()) }
    }

    /// Grow or shrink the stack so `index` becomes the top.
    pub fn set_top(&mut self, index: i32) {
        unsafe { ffi::lua_settop(self.raw(), index) }
    }

    /// Convert an acceptable index into an absolute one.
    pub fn abs_index(&self, index: i32) -> i32 {
        unsafe { ffi::lua_absindex(self.raw(), index) }
    }

    /// Ensure room for `extra` more slots.
    pub fn check_stack(&mut self, extra: i32) -> bool {
        unsafe { ffi::lua_checkstack(self.raw(), extra) != 0 }
    }

    /// Pop `n` elements.
    pub fn pop(&mut self, n: i32) {
        self.set_top(-n - 1);
    }

    /// Remove the element at `index`, shifting the elements above it down.
    pub fn remove(&mut self, index: i32) {
        self.rotate(index, -1);
        self.pop(1);
    }

    /// Move the top element into `index`, replacing what was there.
    pub fn replace(&mut self, index: i32) {
        self.copy(-1, index);
        self.pop(1);
    }

    /// Move the top element into `index`, shifting the elements above it up.
    pub fn insert(&mut self, index: i32) {
        self.rotate(index, 1);
    }

    /// Exchange the elements at `a` and `b`.
    pub fn swap(&mut self, a: i32, b: i32) {
        let (a, b) = (self.abs_index(a), self.abs_index(b));
        self.push_value(a);
        self.copy(b, a);
        self.replace(b);
    }

    /// Push a copy of the element at `index`.
    pub fn push_value(&mut self, index: i32) {
        unsafe { ffi::lua_pushvalue(self.raw(), index) }
    }

    /// Copy the element at `from` into `to`.
    pub fn copy(&mut self, from: i32, to: i32) {
        unsafe { ffi::lua_copy(self.raw(), from, to) }
    }

    /// Rotate the elements between `index` and the top by `n` positions.
    pub fn rotate(&mut self, index: i32, n: i32) {
        unsafe { ffi::lua_rotate(self.raw(), index, n) }
    }

    // Type and value access

    /// Type of the element at `index`; `Type::None` for an empty slot.
    pub fn type_of(&self, index: i32) -> Type {
        Type::from_raw(unsafe { ffi::lua_type(self.raw(), index) })
    }

    /// True for integer-subtyped numbers.
    pub fn is_integer(&self, index: i32) -> bool {
        unsafe { ffi::lua_isinteger(self.raw(), index) != 0 }
    }

    /// Truthiness: everything except `nil` and `false` is true.
    pub fn to_boolean(&self, index: i32) -> bool {
        unsafe { ffi::lua_toboolean(self.raw(), index) != 0 }
    }

    /// The integer at `index`, or 0 when it has no exact integer value.
    pub fn to_integer(&self, index: i32) -> i64 {
        unsafe { ffi::lua_tointegerx(self.raw(), index, ptr::null_mut()) }
    }

    /// The number at `index`, or 0 when it is not convertible.
    pub fn to_number(&self, index: i32) -> f64 {
        unsafe { ffi::lua_tonumberx(self.raw(), index, ptr::null_mut()) }
    }

    /// Bytes of the element at `index`. Strings are copied verbatim; other
    /// values go through `tostring`, including `__tostring` metamethods.
    /// A `__tostring` that fails falls back to the plain `type: address`
    /// form; use [`State::try_to_bytes`] to see the error instead.
    pub fn to_bytes(&mut self, index: i32) -> Vec<u8> {
        let index = self.abs_index(index);
        match self.try_to_bytes(index) {
            Ok(bytes) => bytes,
            Err(_) => self.describe(index).into_bytes(),
        }
    }

    /// `type: address` for the value at `index`, without metamethods and
    /// without touching the stack.
    pub(crate) fn describe(&self, index: i32) -> String {
        let ptr = unsafe { ffi::lua_topointer(self.raw(), index) };
        format!("{}: {ptr:p}", self.type_of(index))
    }

    /// Like [`State::to_bytes`], returning the error raised by a failing
    /// `__tostring` metamethod.
    pub fn try_to_bytes(&mut self, index: i32) -> Result<Vec<u8>> {
        if self.type_of(index) == Type::String {
            let mut len = 0usize;
            return Ok(unsafe {
                let ptr = ffi::lua_tolstring(self.raw(), index, &mut len);
                slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec()
            });
        }
        let index = self.abs_index(index);
        self.reserve(2)?;
        unsafe { ffi::lua_pushcclosure(self.raw(), raw_tostring, 0) };
        self.push_value(index);
        self.protected(1, 1)?;
        let mut len = 0usize;
        let bytes = unsafe {
            let ptr = ffi::lua_tolstring(self.raw(), -1, &mut len);
            slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec()
        };
        self.pop(1);
        Ok(bytes)
    }

    /// Like [`State::to_bytes`], decoded lossily as UTF-8.
    pub fn to_string(&mut self, index: i32) -> String {
        String::from_utf8_lossy(&self.to_bytes(index)).into_owned()
    }

    /// Like [`State::try_to_bytes`], decoded lossily as UTF-8.
    pub fn try_to_string(&mut self, index: i32) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.try_to_bytes(index)?).into_owned())
    }

    /// Push a boolean.
    pub fn push_boolean(&mut self, value: bool) {
        unsafe { ffi::lua_pushboolean(self.raw(), i32::from(value)) }
    }

    /// Push an integer.
    pub fn push_integer(&mut self, value: i64) {
        unsafe { ffi::lua_pushinteger(self.raw(), value) }
    }

    /// Push a float.
    pub fn push_number(&mut self, value: f64) {
        unsafe { ffi::lua_pushnumber(self.raw(), value) }
    }

    /// Push a byte string. Interior NULs are preserved.
    pub fn push_string(&mut self, value: impl AsRef<[u8]>) {
        let bytes = value.as_ref();
        unsafe {
            ffi::lua_pushlstring(self.raw(), bytes.as_ptr().cast::<c_char>(), bytes.len());
        }
    }

    /// Push `nil`.
    pub fn push_nil(&mut self) {
        unsafe { ffi::lua_pushnil(self.raw()) }
    }

    // Tables

    /// Push a new table with preallocated array and hash parts.
    pub fn create_table(&mut self, narr: i32, nrec: i32) {
        unsafe { ffi::lua_createtable(self.raw(), narr, nrec) }
    }

    /// Push `t[name]` where `t` is at `index`, honoring `__index`.
    pub fn get_field(&mut self, index: i32, name: &str) -> Result<Type> {
        let index = self.abs_index(index);
        self.reserve(3)?;
        unsafe { ffi::lua_pushcclosure(self.raw(), raw_gettable, 0) };
        self.push_value(index);
        self.push_string(name);
        self.protected(2, 1)?;
        Ok(self.type_of(-1))
    }

    /// Pop a value and assign it to `t[name]` where `t` is at `index`,
    /// honoring `__newindex`. The value is popped on failure too.
    pub fn set_field(&mut self, index: i32, name: &str) -> Result<()> {
        let index = self.abs_index(index);
        if let Err(err) = self.reserve(3) {
            self.pop(1);
            return Err(err);
        }
        unsafe { ffi::lua_pushcclosure(self.raw(), raw_settable, 0) };
        self.push_value(index);
        self.push_string(name);
        self.rotate(-4, -1);
        self.protected(3, 0)
    }

    /// Push `t[pos]` where `t` is at `index`, honoring `__index`.
    pub fn get_i(&mut self, index: i32, pos: i64) -> Result<Type> {
        let index = self.abs_index(index);
        self.reserve(3)?;
        unsafe { ffi::lua_pushcclosure(self.raw(), raw_gettable, 0) };
        self.push_value(index);
        self.push_integer(pos);
        self.protected(2, 1)?;
        Ok(self.type_of(-1))
    }

    /// Pop a value and assign it to `t[pos]` where `t` is at `index`,
    /// honoring `__newindex`. The value is popped on failure too.
    pub fn set_i(&mut self, index: i32, pos: i64) -> Result<()> {
        let index = self.abs_index(index);
        if let Err(err) = self.reserve(3) {
            self.pop(1);
            return Err(err);
        }
        unsafe { ffi::lua_pushcclosure(self.raw(), raw_settable, 0) };
        self.push_value(index);
        self.push_integer(pos);
        self.rotate(-4, -1);
        self.protected(3, 0)
    }

    /// Pop a key and push the next key/value pair of the table at `index`.
    /// Returns false, pushing nothing, when the traversal is over.
    pub fn next(&mut self, index: i32) -> bool {
        unsafe { ffi::lua_next(self.raw(), index) != 0 }
    }

    /// Length of the value at `index`, honoring `__len`. A `__len` returning
    /// a non-integer counts as 0.
    pub fn len(&mut self, index: i32) -> Result<i64> {
        let index = self.abs_index(index);
        self.reserve(2)?;
        unsafe { ffi::lua_pushcclosure(self.raw(), raw_len, 0) };
        self.push_value(index);
        self.protected(1, 1)?;
        let len = self.to_integer(-1);
        self.pop(1);
        Ok(len)
    }

    /// Push the global `name`.
    pub fn get_global(&mut self, name: &str) -> Result<Type> {
        self.push_globals()?;
        let typ = self.get_field(-1, name);
        if typ.is_ok() {
            self.remove(-2);
        } else {
            self.pop(1);
        }
        typ
    }

    /// Pop a value and assign it to the global `name`.
    pub fn set_global(&mut self, name: &str) -> Result<()> {
        if let Err(err) = self.push_globals() {
            self.pop(1);
            return Err(err);
        }
        self.insert(-2);
        let result = self.set_field(-2, name);
        self.pop(1);
        result
    }

    fn push_globals(&mut self) -> Result<()> {
        self.reserve(1)?;
        unsafe { ffi::lua_rawgeti(self.raw(), ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS.into()) };
        Ok(())
    }

    // Metatables

    /// Push the registry metatable for `name`, creating it when missing.
    /// New metatables get `__name` and a `__gc` that releases userdata
    /// handles, so typed userdata never leak their store entry.
    pub fn new_type_metatable(&mut self, name: &str) -> bool {
        let c = c_name(name);
        let created = unsafe { ffi::luaL_newmetatable(self.raw(), c.as_ptr()) != 0 };
        if created {
            unsafe {
                ffi::lua_pushcclosure(self.raw(), function::collect_userdata, 0);
                ffi::lua_setfield(self.raw(), -2, c"__gc".as_ptr());
            }
        }
        created
    }

    /// Push the registry metatable for `name` (nil when missing).
    pub fn get_type_metatable(&mut self, name: &str) -> Type {
        let name = c_name(name);
        Type::from_raw(unsafe {
            ffi::lua_getfield(self.raw(), ffi::LUA_REGISTRYINDEX, name.as_ptr())
        })
    }

    /// Pop a table and set it as the metatable of the value at `index`.
    pub fn set_metatable(&mut self, index: i32) {
        unsafe {
            ffi::lua_setmetatable(self.raw(), index);
        }
    }

    /// Push the metatable of the value at `index`, if it has one.
    pub fn get_metatable(&mut self, index: i32) -> bool {
        unsafe { ffi::lua_getmetatable(self.raw(), index) != 0 }
    }

    // Calls

    /// Call the function below `nargs` arguments in protected mode.
    ///
    /// On success the function and arguments are replaced by `nret` results
    /// (all of them with [`MULTRET`]). On failure they are popped and the
    /// error object is converted: host errors come back exactly as raised,
    /// interpreter errors are annotated with location and traceback.
    pub fn call(&mut self, nargs: i32, nret: i32) -> Result<()> {
        let base = self.get_top() - nargs;
        unsafe { ffi::lua_pushcclosure(self.raw(), function::message_handler, 0) };
        self.insert(base);

        let status = unsafe { ffi::lua_pcallk(self.raw(), nargs, nret, base, 0, None) };
        let result = self.check_status(status);
        self.remove(base);
        result
    }

    /// Like [`State::call`], with the message handler at `handler` instead of
    /// the built-in traceback handler. The handler stays on the stack.
    pub fn call_with_handler(&mut self, nargs: i32, nret: i32, handler: i32) -> Result<()> {
        let handler = self.abs_index(handler);
        let status = unsafe { ffi::lua_pcallk(self.raw(), nargs, nret, handler, 0, None) };
        self.check_status(status)
    }

    /// Call the native function below `nargs` arguments in protected mode,
    /// without a message handler. Used for primitives whose metamethods may
    /// raise, so the error never unwinds through host frames.
    fn protected(&mut self, nargs: i32, nret: i32) -> Result<()> {
        let status = unsafe { ffi::lua_pcallk(self.raw(), nargs, nret, 0, 0, None) };
        self.check_status(status)
    }

    /// Fail with a memory error unless `extra` more slots fit on the stack.
    pub(crate) fn reserve(&mut self, extra: i32) -> Result<()> {
        if self.check_stack(extra) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Memory, "stack overflow"))
        }
    }

    /// Convert a status code; on error, pops and converts the error object.
    pub(crate) fn check_status(&mut self, status: i32) -> Result<()> {
        match ErrorKind::from_status(status) {
            None => Ok(()),
            Some(ErrorKind::Yield) => Err(Error::new(ErrorKind::Yield, "attempt to yield")),
            Some(kind) => Err(unsafe { function::take_error(self.raw(), kind) }),
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if self.owned {
            let raw = self.raw();
            hook::forget_state(raw);
            unsafe { ffi::lua_close(raw) };
            tracing::debug!("closed interpreter state {:p}", raw);
        }
    }
}

// Raising primitives, run through `State::protected`. Their frames hold
// nothing with a destructor.

unsafe extern "C-unwind" fn raw_gettable(raw: *mut ffi::lua_State) -> c_int {
    unsafe { ffi::lua_gettable(raw, 1) };
    1
}

unsafe extern "C-unwind" fn raw_settable(raw: *mut ffi::lua_State) -> c_int {
    unsafe { ffi::lua_settable(raw, 1) };
    0
}

unsafe extern "C-unwind" fn raw_len(raw: *mut ffi::lua_State) -> c_int {
    unsafe { ffi::lua_len(raw, 1) };
    1
}

unsafe extern "C-unwind" fn raw_tostring(raw: *mut ffi::lua_State) -> c_int {
    unsafe { ffi::luaL_tolstring(raw, 1, ptr::null_mut()) };
    1
}

/// Main thread of the interpreter that `raw` belongs to.
pub(crate) unsafe fn main_thread_of(raw: *mut ffi::lua_State) -> *mut ffi::lua_State {
    unsafe {
        ffi::lua_rawgeti(raw, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_MAINTHREAD.into());
        let main = ffi::lua_tothread(raw, -1);
        ffi::lua_settop(raw, -2);
        main
    }
}

/// C string for a field or global name. Anything after an interior NUL is
/// dropped, which is what the C API would see anyway.
pub(crate) fn c_name(name: &str) -> CString {
    let end = name.find('\0').unwrap_or(name.len());
    CString::new(&name[..end]).unwrap_or_default()
}
