//! Host replacements for the script-level protected calls.
//!
//! Both run on [`State::call`], so a host error raised inside keeps its kind
//! and trace, and the script receives the one-line `chunk:line: message`
//! form. Cancellation is never caught: it keeps unwinding to the run that
//! installed the context.

use crate::{
    error::Result,
    state::{MULTRET, State},
};

/// `pcall(f, ...)`: `true, results...` or `false, message`.
pub(crate) fn pcall(state: &mut State) -> Result<usize> {
    if state.get_top() < 1 {
        return Err(state.arg_error(1, "value expected"));
    }
    let nargs = state.get_top() - 1;
    match state.call(nargs, MULTRET) {
        Ok(()) => {
            state.push_boolean(true);
            state.rotate(1, 1);
        }
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => {
            state.set_top(0);
            state.push_boolean(false);
            state.push_string(err.one_line());
        }
    }
    Ok(state.get_top() as usize)
}

/// `xpcall(f, handler, ...)`: `true, results...`, or `false` followed by
/// whatever the handler returns for the one-line message.
pub(crate) fn xpcall(state: &mut State) -> Result<usize> {
    if state.get_top() < 2 {
        return Err(state.arg_error(2, "value expected"));
    }
    state.swap(1, 2);
    let nargs = state.get_top() - 2;
    match state.call(nargs, MULTRET) {
        Ok(()) => {
            state.push_boolean(true);
            state.replace(1);
        }
        Err(err) if err.is_cancelled() => return Err(err),
        Err(err) => {
            state.set_top(1);
            state.push_string(err.one_line());
            state.call(1, MULTRET)?;
            state.push_boolean(false);
            state.rotate(1, 1);
        }
    }
    Ok(state.get_top() as usize)
}
