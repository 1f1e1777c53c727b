//! The `time` module: wall clock, released-lock sleeps and timers.
//!
//! Durations are milliseconds throughout, as numbers.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use gilua::{HostFunction, State, Value};

use crate::environment::{Environment, Shared};

const DEFAULT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

const MILLISECOND: i64 = 1;
const SECOND: i64 = 1000 * MILLISECOND;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const YEAR: i64 = 365 * DAY;

fn unix_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

fn millis(state: &mut State, index: i32) -> gilua::Result<Duration> {
    let ms = state.check_number(index)?;
    if !ms.is_finite() || ms < 0.0 {
        return Err(state.arg_error(index, "duration must be a non-negative number"));
    }
    Ok(Duration::from_secs_f64(ms / 1000.0))
}

/// `time.now()`: milliseconds since the Unix epoch. Yields first.
fn now(env: &Weak<Shared>) -> HostFunction {
    let env = env.clone();
    Arc::new(move |state: &mut State| {
        Environment::upgrade(&env)?.yield_now();
        state.push_integer(unix_millis());
        Ok(1)
    })
}

/// `time.sleep(ms)`: sleep with the lock released. Cut short, with an
/// error, when the running session is cancelled.
fn sleep(env: &Weak<Shared>) -> HostFunction {
    let env = env.clone();
    Arc::new(move |state: &mut State| {
        let env = Environment::upgrade(&env)?;
        let duration = millis(state, 1)?;
        let ctx = env.context();
        env.block_on(state, async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => Ok(()),
                reason = ctx.done() => Err(gilua::Error::from(reason)),
            }
        })?;
        Ok(0)
    })
}

/// `time.format(ms [, format])`: render a timestamp with `os.date`.
fn format(env: &Weak<Shared>) -> HostFunction {
    let env = env.clone();
    Arc::new(move |state: &mut State| {
        Environment::upgrade(&env)?.yield_now();
        let ms = state.check_number(1)?;
        let format = match state.type_of(2) {
            gilua::Type::None | gilua::Type::Nil => DEFAULT_FORMAT.to_string(),
            _ => state.check_string(2)?,
        };

        state.get_global("os")?;
        state.get_field(-1, "date")?;
        state.push_string(format);
        state.push_integer((ms / 1000.0).floor() as i64);
        if let Err(err) = state.call(2, 1) {
            return Err(state.error(1, err));
        }
        state.remove(-2);
        Ok(1)
    })
}

/// `time.after(ms, fn)`: call `fn` once, from the background, after `ms`.
/// The timer outlives the run that set it; it is dropped without a call if
/// the environment closes first.
fn after(env: &Weak<Shared>) -> HostFunction {
    let env = env.clone();
    Arc::new(move |state: &mut State| {
        let env = Environment::upgrade(&env)?;
        let delay = millis(state, 1)?;
        let callback = env.callback(state, 2)?;
        let ctx = env.root_context();

        let timer_env = env.clone();
        let _ = env.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                reason = ctx.done() => {
                    tracing::debug!(%reason, "timer dropped");
                    return;
                }
            }
            match timer_env.spawn_invoke(callback, Vec::<Value>::new(), 0).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::warn!("timer callback failed: {err}"),
                Err(err) => tracing::warn!("timer callback task failed: {err}"),
            }
        });
        Ok(0)
    })
}

pub(crate) fn register(state: &mut State, env: &Weak<Shared>) -> gilua::Result<()> {
    let mut funcs: HashMap<&str, HostFunction> = HashMap::new();
    funcs.insert("now", now(env));
    funcs.insert("sleep", sleep(env));
    funcs.insert("format", format(env));
    funcs.insert("after", after(env));

    state.create_table(0, funcs.len() as i32 + 7);
    state.set_functions(-1, funcs)?;
    state.set_integer_field(-1, "millisecond", MILLISECOND)?;
    state.set_integer_field(-1, "second", SECOND)?;
    state.set_integer_field(-1, "minute", MINUTE)?;
    state.set_integer_field(-1, "hour", HOUR)?;
    state.set_integer_field(-1, "day", DAY)?;
    state.set_integer_field(-1, "week", WEEK)?;
    state.set_integer_field(-1, "year", YEAR)?;
    state.set_global("time")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_after_2020() {
        assert!(unix_millis() > 1_577_836_800_000);
    }

    #[test]
    fn units() {
        assert_eq!(MINUTE, 60_000);
        assert_eq!(DAY, 86_400_000);
        assert_eq!(YEAR, 31_536_000_000);
    }
}
