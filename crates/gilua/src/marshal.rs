//! Conversion between stack values and [`Value`].

use std::{
    any::Any,
    collections::{BTreeMap, HashSet},
    ffi::c_void,
    sync::Arc,
};

use crate::{
    ffi,
    function::{USERDATA_META, USERDATA_TAG, collect_userdata, push_kind_metatable, push_slot, read_slot},
    state::State,
    store::{Handle, USERDATA, Userdata},
    types::Type,
    value::{NumberMode, Value},
};

/// Deepest table nesting converted in either direction. Deeper tables
/// become [`Value::Opaque`] on the way out and `nil` on the way in.
pub const MAX_DEPTH: usize = 200;

impl State {
    /// Copy the value at `index` out of the interpreter.
    ///
    /// Tables become [`Value::Array`] when their keys are exactly the
    /// integers `1..=n` (an empty table included) and [`Value::Map`]
    /// otherwise, keyed by the `tostring` form of each key. A table reached
    /// again through itself, or nested deeper than [`MAX_DEPTH`], is cut off
    /// as [`Value::Opaque`].
    pub fn to_any(&mut self, index: i32) -> Value {
        self.to_value_with(index, NumberMode::Exact)
    }

    /// [`State::to_any`] with a choice of number conversion.
    pub fn to_value_with(&mut self, index: i32, mode: NumberMode) -> Value {
        let index = self.abs_index(index);
        let mut path = HashSet::new();
        self.convert(index, mode, &mut path, 0)
    }

    fn convert(
        &mut self,
        index: i32,
        mode: NumberMode,
        path: &mut HashSet<*const c_void>,
        depth: usize,
    ) -> Value {
        match self.type_of(index) {
            Type::None | Type::Nil => Value::Nil,
            Type::Boolean => Value::Boolean(self.to_boolean(index)),
            Type::Number => match mode {
                NumberMode::Exact if self.is_integer(index) => Value::Integer(self.to_integer(index)),
                _ => Value::Number(self.to_number(index)),
            },
            Type::String => Value::String(self.to_bytes(index)),
            Type::Table => self.convert_table(index, mode, path, depth),
            Type::Userdata => match self.to_userdata(index) {
                Some(value) => Value::Userdata(value),
                None => Value::Opaque(self.to_string(index)),
            },
            Type::LightUserdata | Type::Function | Type::Thread => Value::Opaque(self.to_string(index)),
        }
    }

    fn convert_table(
        &mut self,
        index: i32,
        mode: NumberMode,
        path: &mut HashSet<*const c_void>,
        depth: usize,
    ) -> Value {
        if depth >= MAX_DEPTH || !self.check_stack(4) {
            return Value::Opaque(self.describe(index));
        }
        let ptr = unsafe { ffi::lua_topointer(self.raw(), index) };
        if !path.insert(ptr) {
            return Value::Opaque(self.to_string(index));
        }

        let mut entries = Vec::new();
        let mut sequential = true;
        self.push_nil();
        while self.next(index) {
            let top = self.get_top();
            let value = self.convert(top, mode, path, depth + 1);
            let position = self.is_integer(top - 1).then(|| self.to_integer(top - 1));
            sequential &= position.is_some();
            let key = self.to_string(top - 1);
            entries.push((position, key, value));
            self.pop(1);
        }
        path.remove(&ptr);

        let count = entries.len();
        let is_array = sequential
            && entries
                .iter()
                .all(|(position, ..)| position.is_some_and(|p| p >= 1 && p as usize <= count));

        if is_array {
            let mut items = vec![Value::Nil; count];
            for (position, _, value) in entries {
                if let Some(p) = position {
                    items[p as usize - 1] = value;
                }
            }
            Value::Array(items)
        } else {
            Value::Map(entries.into_iter().map(|(_, key, value)| (key, value)).collect::<BTreeMap<_, _>>())
        }
    }

    /// Push a host value. Arrays and maps become fresh tables, functions
    /// become new closures, opaque values become their string form.
    /// Containers nested deeper than [`MAX_DEPTH`], or that no longer fit on
    /// the stack, are pushed as `nil`.
    pub fn push_any(&mut self, value: &Value) {
        self.push_nested(value, 0);
    }

    fn push_nested(&mut self, value: &Value, depth: usize) {
        let container = matches!(value, Value::Array(_) | Value::Map(_));
        if container && (depth >= MAX_DEPTH || !self.check_stack(3)) {
            self.push_nil();
            return;
        }
        match value {
            Value::Nil => self.push_nil(),
            Value::Boolean(b) => self.push_boolean(*b),
            Value::Integer(i) => self.push_integer(*i),
            Value::Number(n) => self.push_number(*n),
            Value::String(bytes) => self.push_string(bytes),
            Value::Opaque(repr) => self.push_string(repr),
            Value::Array(items) => {
                self.create_table(i32::try_from(items.len()).unwrap_or(0), 0);
                for (i, item) in items.iter().enumerate() {
                    self.push_nested(item, depth + 1);
                    unsafe { ffi::lua_rawseti(self.raw(), -2, i as i64 + 1) };
                }
            }
            Value::Map(entries) => {
                self.create_table(0, i32::try_from(entries.len()).unwrap_or(0));
                for (key, item) in entries {
                    self.push_string(key);
                    self.push_nested(item, depth + 1);
                    unsafe { ffi::lua_rawset(self.raw(), -3) };
                }
            }
            Value::Userdata(data) => {
                self.push_shared_userdata(data.clone());
            }
            Value::Function(f) => {
                self.push_host_function(f.clone());
            }
        }
    }

    /// Push `value` as an opaque userdata and return its handle. The value
    /// is dropped from the store when the userdata is collected.
    pub fn push_userdata<T: Any + Send + Sync>(&mut self, value: T) -> Handle {
        self.push_shared_userdata(Arc::new(value))
    }

    /// Push an already shared host value as a userdata.
    pub fn push_shared_userdata(&mut self, value: Userdata) -> Handle {
        let handle = USERDATA.push(value);
        unsafe {
            push_slot(self.raw(), USERDATA_TAG, handle);
            push_kind_metatable(self.raw(), USERDATA_META, collect_userdata, None);
            ffi::lua_setmetatable(self.raw(), -2);
        }
        handle
    }

    /// Push `value` as a userdata whose metatable is the registry metatable
    /// `type_name`, created by [`State::new_type_metatable`] when missing.
    /// A `__gc` replaced by the caller must still release the handle, or the
    /// value stays in the store.
    pub fn push_userdata_with_type<T: Any + Send + Sync>(&mut self, value: T, type_name: &str) -> Handle {
        let handle = USERDATA.push(Arc::new(value));
        unsafe { push_slot(self.raw(), USERDATA_TAG, handle) };
        self.new_type_metatable(type_name);
        self.set_metatable(-2);
        handle
    }

    /// The host value of a userdata created by this crate, whatever its
    /// metatable. `None` for anything else.
    pub fn to_userdata(&mut self, index: i32) -> Option<Userdata> {
        let handle = unsafe { read_slot(self.raw(), index, USERDATA_TAG) }?;
        USERDATA.get(handle)
    }

    /// [`State::to_userdata`] downcast to `T`.
    pub fn to_userdata_as<T: Any + Send + Sync>(&mut self, index: i32) -> Option<Arc<T>> {
        self.to_userdata(index)?.downcast::<T>().ok()
    }
}
