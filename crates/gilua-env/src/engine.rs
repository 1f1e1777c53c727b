use std::sync::Weak;

use gilua::State;

use crate::{environment::Shared, time};

/// Register the host modules every environment provides.
pub(crate) fn install(state: &mut State, env: &Weak<Shared>) -> gilua::Result<()> {
    install_print(state, env.clone())?;
    time::register(state, env)
}

/// Replace `print` with a capture into the environment's log. A line is
/// recorded whole, under the lock, so concurrent sessions never interleave.
fn install_print(state: &mut State, env: Weak<Shared>) -> gilua::Result<()> {
    state.push_function(move |state: &mut State| {
        let count = state.get_top();
        let mut line = String::new();
        for i in 1..=count {
            if i > 1 {
                line.push('\t');
            }
            line.push_str(&state.try_to_string(i)?);
        }
        if let Some(env) = env.upgrade() {
            env.push_log(line);
        }
        Ok(0)
    });
    state.set_global("print")
}
