//! Registry references and secondary threads.

use std::{
    ffi::c_int,
    ops::{Deref, DerefMut},
};

use crate::{ffi, state::State, types::Type};

/// A value pinned in the registry. Release it with [`State::unreference`];
/// a reference that is simply dropped keeps its value alive until the
/// interpreter is closed.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RegistryRef(c_int);

impl RegistryRef {
    /// Whether the pinned value was `nil` (nothing is actually pinned).
    pub fn is_nil(&self) -> bool {
        self.0 == ffi::LUA_REFNIL
    }
}

impl State {
    /// Pin the value at `index` in the registry.
    pub fn reference(&mut self, index: i32) -> RegistryRef {
        self.push_value(index);
        RegistryRef(unsafe { ffi::luaL_ref(self.raw(), ffi::LUA_REGISTRYINDEX) })
    }

    /// Push the value pinned by `reference`.
    pub fn push_reference(&mut self, reference: &RegistryRef) -> Type {
        Type::from_raw(unsafe {
            ffi::lua_rawgeti(self.raw(), ffi::LUA_REGISTRYINDEX, reference.0.into())
        })
    }

    /// Release a pinned value so it can be collected.
    pub fn unreference(&mut self, reference: RegistryRef) {
        unsafe { ffi::luaL_unref(self.raw(), ffi::LUA_REGISTRYINDEX, reference.0) }
    }

    /// Create a thread sharing this interpreter's globals but with its own
    /// stack. The thread is pinned in the registry until the returned value
    /// is dropped. Nothing is left on this state's stack.
    pub fn new_thread(&mut self) -> Thread {
        unsafe {
            let raw = ffi::lua_newthread(self.raw());
            let anchor = RegistryRef(ffi::luaL_ref(self.raw(), ffi::LUA_REGISTRYINDEX));
            Thread {
                state: State::borrowed(raw),
                anchor,
            }
        }
    }
}

/// A secondary interpreter thread. Dereferences to the [`State`] of the
/// thread; the stack is private, globals and registry are shared.
pub struct Thread {
    state: State,
    anchor: RegistryRef,
}

impl Deref for Thread {
    type Target = State;

    fn deref(&self) -> &State {
        &self.state
    }
}

impl DerefMut for Thread {
    fn deref_mut(&mut self) -> &mut State {
        &mut self.state
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        let raw = self.state.raw();
        unsafe {
            ffi::lua_settop(raw, 0);
            ffi::luaL_unref(raw, ffi::LUA_REGISTRYINDEX, self.anchor.0);
        }
    }
}
