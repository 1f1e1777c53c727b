use std::{fmt, ops::BitOr};

use crate::ffi;

/// Lua value type tag, as reported by `lua_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// Acceptable index with no value.
    None,
    /// `nil`
    Nil,
    /// `true` / `false`
    Boolean,
    /// Raw C pointer.
    LightUserdata,
    /// Integer or float.
    Number,
    /// Byte string.
    String,
    /// Table.
    Table,
    /// Lua or C function.
    Function,
    /// Full userdata.
    Userdata,
    /// Coroutine.
    Thread,
}

impl Type {
    pub(crate) fn from_raw(raw: i32) -> Self {
        match raw {
            ffi::LUA_TNIL => Self::Nil,
            ffi::LUA_TBOOLEAN => Self::Boolean,
            ffi::LUA_TLIGHTUSERDATA => Self::LightUserdata,
            ffi::LUA_TNUMBER => Self::Number,
            ffi::LUA_TSTRING => Self::String,
            ffi::LUA_TTABLE => Self::Table,
            ffi::LUA_TFUNCTION => Self::Function,
            ffi::LUA_TUSERDATA => Self::Userdata,
            ffi::LUA_TTHREAD => Self::Thread,
            _ => Self::None,
        }
    }

    /// Type name as the interpreter prints it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Nil => "nil",
            Self::Boolean => "boolean",
            Self::LightUserdata => "lightuserdata",
            Self::Number => "number",
            Self::String => "string",
            Self::Table => "table",
            Self::Function => "function",
            Self::Userdata => "userdata",
            Self::Thread => "thread",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of events a hook subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HookMask(i32);

impl HookMask {
    /// No events; installing an empty mask removes the hook.
    pub const NONE: Self = Self(0);
    /// Function calls.
    pub const CALL: Self = Self(ffi::LUA_MASKCALL);
    /// Function returns.
    pub const RET: Self = Self(ffi::LUA_MASKRET);
    /// Each new line of code.
    pub const LINE: Self = Self(ffi::LUA_MASKLINE);
    /// Every `count` instructions.
    pub const COUNT: Self = Self(ffi::LUA_MASKCOUNT);

    /// Raw mask bits.
    pub fn bits(self) -> i32 {
        self.0
    }

    /// True when no event is selected.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when all events in `other` are selected.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HookMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Event that fired a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// A function is being called.
    Call,
    /// A function is returning.
    Ret,
    /// A tail call replaced the current frame.
    TailCall,
    /// Execution reached a new line.
    Line,
    /// The instruction counter elapsed.
    Count,
    /// Unrecognized event code.
    Unknown,
}

impl HookEvent {
    pub(crate) fn from_raw(raw: i32) -> Self {
        match raw {
            ffi::LUA_HOOKCALL => Self::Call,
            ffi::LUA_HOOKRET => Self::Ret,
            ffi::LUA_HOOKTAILCALL => Self::TailCall,
            ffi::LUA_HOOKLINE => Self::Line,
            ffi::LUA_HOOKCOUNT => Self::Count,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Call => "call",
            Self::Ret => "ret",
            Self::TailCall => "tailcall",
            Self::Line => "line",
            Self::Count => "count",
            Self::Unknown => "unknown",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_combines() {
        let mask = HookMask::LINE | HookMask::COUNT;
        assert!(mask.contains(HookMask::LINE));
        assert!(mask.contains(HookMask::COUNT));
        assert!(!mask.contains(HookMask::CALL));
        assert!(HookMask::NONE.is_empty());
    }

    #[test]
    fn type_names() {
        assert_eq!(Type::from_raw(ffi::LUA_TSTRING).to_string(), "string");
        assert_eq!(Type::from_raw(ffi::LUA_TNONE), Type::None);
        assert_eq!(Type::LightUserdata.name(), "lightuserdata");
    }
}
