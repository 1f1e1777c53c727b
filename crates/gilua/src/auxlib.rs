//! Auxiliary helpers: error raising with location, tracebacks, argument
//! checks and table field setters.

use std::{collections::HashMap, fmt, ptr};

use crate::{
    error::{Error, Result},
    ffi,
    function::HostFunction,
    state::State,
    store::Userdata,
    types::Type,
};

/// Where a raw error message points, as found by walking the stack.
pub(crate) struct Located {
    pub level: i32,
    pub chunk_name: String,
    pub line: u32,
    pub message: String,
}

impl State {
    /// Chunk name and current line of the function `level` levels up, parsed
    /// from the interpreter's `where` string. Returns `("", 0)` for frames
    /// without source information.
    pub fn where_(&mut self, level: i32) -> (String, u32) {
        unsafe { ffi::luaL_where(self.raw(), level) };
        let location = self.to_string(-1);
        self.pop(1);
        parse_where(&location)
    }

    /// `stack traceback:` block starting `level` levels up.
    pub fn traceback(&mut self, level: i32) -> String {
        unsafe { ffi::luaL_traceback(self.raw(), self.raw(), ptr::null(), level) };
        let traceback = self.to_string(-1);
        self.pop(1);
        traceback
    }

    /// Annotate `err` with the location and traceback of the function
    /// `level` levels up. An already traced error is returned unchanged.
    ///
    /// Host functions raise by returning the result: `return Err(state.error(1, err))`.
    pub fn error(&mut self, level: i32, err: impl Into<Error>) -> Error {
        let err = err.into();
        if matches!(err, Error::Traced(_)) {
            return err;
        }
        if level > 0 {
            let (chunk_name, line) = self.where_(level);
            let traceback = self.traceback(level);
            Error::traced(err, chunk_name, line, traceback)
        } else {
            let traceback = self.traceback(1);
            Error::traced(err, String::new(), 0, traceback)
        }
    }

    /// [`State::error`] with a formatted runtime error.
    pub fn errorf(&mut self, level: i32, args: fmt::Arguments<'_>) -> Error {
        self.error(level, Error::runtime(fmt::format(args)))
    }

    /// `bad argument #arg to 'name' (message)` for the running host function.
    pub fn arg_error(&mut self, arg: i32, message: impl fmt::Display) -> Error {
        let name = self.get_stack(0).map(|mut frame| frame.name().name);
        match name {
            Some(name) if !name.is_empty() => {
                self.errorf(1, format_args!("bad argument #{arg} to '{name}' ({message})"))
            }
            _ => self.errorf(1, format_args!("bad argument #{arg} ({message})")),
        }
    }

    /// Find the chunk and line a raw error message refers to. The message
    /// prefix `chunk:line: ` is stripped when it matches a frame on the stack.
    pub(crate) fn locate_message(&mut self, message: &str) -> Located {
        let mut first_lua = None;
        let mut level = 1;
        loop {
            let Some(mut frame) = self.get_stack(level) else {
                break;
            };
            let source = frame.source();
            if source.what != "C" {
                let current = u32::try_from(frame.current_line()).unwrap_or(0);
                let first = first_lua.get_or_insert((level, source.short_src.clone(), current));
                if let Some((line, rest)) = split_location(message, &source.short_src) {
                    return Located {
                        level: first.0,
                        chunk_name: source.short_src,
                        line,
                        message: rest.to_string(),
                    };
                }
            }
            level += 1;
        }

        match first_lua {
            Some((level, chunk_name, line)) => Located {
                level,
                chunk_name,
                line,
                message: message.to_string(),
            },
            None => Located {
                level: 1,
                chunk_name: String::new(),
                line: 0,
                message: message.to_string(),
            },
        }
    }

    // Argument checks

    /// Fail with an argument error unless the value at `index` has type `typ`.
    pub fn check_type(&mut self, index: i32, typ: Type) -> Result<()> {
        let actual = self.type_of(index);
        if actual == typ {
            Ok(())
        } else {
            let actual = type_label(actual);
            Err(self.arg_error(index, format_args!("{typ} expected, got {actual}")))
        }
    }

    /// A boolean argument.
    pub fn check_boolean(&mut self, index: i32) -> Result<bool> {
        self.check_type(index, Type::Boolean)?;
        Ok(self.to_boolean(index))
    }

    /// An integer argument; floats are rejected.
    pub fn check_integer(&mut self, index: i32) -> Result<i64> {
        if !self.is_integer(index) {
            let actual = type_label(self.type_of(index));
            return Err(self.arg_error(index, format_args!("integer expected, got {actual}")));
        }
        Ok(self.to_integer(index))
    }

    /// A number argument.
    pub fn check_number(&mut self, index: i32) -> Result<f64> {
        self.check_type(index, Type::Number)?;
        Ok(self.to_number(index))
    }

    /// A string argument.
    pub fn check_string(&mut self, index: i32) -> Result<String> {
        self.check_type(index, Type::String)?;
        Ok(self.to_string(index))
    }

    /// A userdata argument created by this crate.
    pub fn check_userdata(&mut self, index: i32) -> Result<Userdata> {
        self.check_type(index, Type::Userdata)?;
        match self.to_userdata(index) {
            Some(value) => Ok(value),
            None => Err(self.arg_error(index, "host value expected, got foreign userdata")),
        }
    }

    // Field setters

    /// `t[name] = value` for the table at `index`.
    pub fn set_boolean_field(&mut self, index: i32, name: &str, value: bool) -> Result<()> {
        let index = self.abs_index(index);
        self.push_boolean(value);
        self.set_field(index, name)
    }

    /// `t[name] = value` for the table at `index`.
    pub fn set_integer_field(&mut self, index: i32, name: &str, value: i64) -> Result<()> {
        let index = self.abs_index(index);
        self.push_integer(value);
        self.set_field(index, name)
    }

    /// `t[name] = value` for the table at `index`.
    pub fn set_number_field(&mut self, index: i32, name: &str, value: f64) -> Result<()> {
        let index = self.abs_index(index);
        self.push_number(value);
        self.set_field(index, name)
    }

    /// `t[name] = value` for the table at `index`.
    pub fn set_string_field(&mut self, index: i32, name: &str, value: impl AsRef<[u8]>) -> Result<()> {
        let index = self.abs_index(index);
        self.push_string(value);
        self.set_field(index, name)
    }

    /// `t[name] = nil` for the table at `index`.
    pub fn set_nil_field(&mut self, index: i32, name: &str) -> Result<()> {
        let index = self.abs_index(index);
        self.push_nil();
        self.set_field(index, name)
    }

    /// `t[name] = f` for the table at `index`.
    pub fn set_function_field<F>(&mut self, index: i32, name: &str, f: F) -> Result<()>
    where
        F: Fn(&mut State) -> Result<usize> + Send + Sync + 'static,
    {
        let index = self.abs_index(index);
        self.push_function(f);
        self.set_field(index, name)
    }

    /// Register every function of `funcs` into the table at `index`.
    pub fn set_functions(&mut self, index: i32, funcs: HashMap<&str, HostFunction>) -> Result<()> {
        let index = self.abs_index(index);
        for (name, f) in funcs {
            self.push_host_function(f);
            self.set_field(index, name)?;
        }
        Ok(())
    }
}

/// Type name as argument errors print it.
fn type_label(typ: Type) -> &'static str {
    match typ {
        Type::None => "no value",
        other => other.name(),
    }
}

/// Split `chunk:line: ` from `location`, as printed by `luaL_where`.
fn parse_where(location: &str) -> (String, u32) {
    let Some(trimmed) = location.strip_suffix(": ") else {
        return (location.to_string(), 0);
    };
    match trimmed.rsplit_once(':') {
        Some((chunk, line)) => match line.parse() {
            Ok(line) => (chunk.to_string(), line),
            Err(_) => (location.to_string(), 0),
        },
        None => (location.to_string(), 0),
    }
}

/// Strip a `chunk:line: ` prefix naming `chunk` from `message`.
fn split_location<'m>(message: &'m str, chunk: &str) -> Option<(u32, &'m str)> {
    let rest = message.strip_prefix(chunk)?.strip_prefix(':')?;
    let (line, rest) = rest.split_once(": ")?;
    Some((line.parse().ok()?, rest))
}
