//! Test utilities for `gilua`.
//!
//! Small helpers shared by the unit and integration tests of this crate and
//! of crates built on it, available via `use gilua::testutils::*`. They
//! panic on failure, which is what a test wants.

use crate::{MULTRET, State, Value};

/// A fresh interpreter with the standard libraries opened.
pub fn new_state() -> State {
    match State::new() {
        Ok(state) => state,
        Err(err) => panic!("cannot create state: {err}"),
    }
}

/// Run `code` and return every value it returns. The stack is left as it
/// was found.
pub fn eval_values(state: &mut State, code: &str) -> Vec<Value> {
    let base = state.get_top();
    if let Err(err) = state.load_string(code) {
        panic!("cannot load {code:?}: {err}");
    }
    if let Err(err) = state.call(0, MULTRET) {
        panic!("cannot run {code:?}: {err}");
    }
    let values = (base + 1..=state.get_top()).map(|i| state.to_any(i)).collect();
    state.set_top(base);
    values
}

/// Run `code` and return its first result, or `Value::Nil`.
pub fn eval(state: &mut State, code: &str) -> Value {
    eval_values(state, code).into_iter().next().unwrap_or_default()
}

/// Install `print` as a function appending its arguments, tab separated,
/// to the global table `output`.
pub fn capture_print(state: &mut State) {
    let code = r##"
        output = {}
        print = function(...)
            local parts = {}
            for i = 1, select("#", ...) do
                parts[#parts + 1] = tostring(select(i, ...))
            end
            output[#output + 1] = table.concat(parts, "\t")
        end
    "##;
    if let Err(err) = state.do_string(code) {
        panic!("cannot install print capture: {err}");
    }
}
