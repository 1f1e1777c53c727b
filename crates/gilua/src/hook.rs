//! Execution hooks and the cancellation hook built on them.
//!
//! The interpreter's hook callback has no room for host context, so the host
//! side of a hook lives in a side table keyed by the thread pointer it was
//! installed on. Threads created later inherit the native hook but not a
//! table entry; they fall back to the innermost cancellable call running on
//! the same OS thread, then to the entry of their main thread.

use std::{
    cell::RefCell,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, LazyLock},
};

use dashmap::DashMap;

use crate::{
    context::CancelContext,
    debug::Debug,
    error::{Error, Result},
    ffi,
    function::{panic_message, raise},
    state::{State, main_thread_of},
    types::HookMask,
};

/// A host hook. Returning `Err` aborts the running script with that error.
pub type HookFunction = Arc<dyn Fn(&mut State, &mut Debug<'_>) -> Result<()> + Send + Sync>;

#[derive(Clone)]
struct HookEntry {
    main: usize,
    mask: HookMask,
    count: i32,
    func: HookFunction,
}

static HOOKS: LazyLock<DashMap<usize, HookEntry>> = LazyLock::new(DashMap::new);

thread_local! {
    /// Hooks of the cancellable calls running on this OS thread, innermost
    /// last, with the main thread of their interpreter.
    static RUNNING: RefCell<Vec<(usize, HookFunction)>> = const { RefCell::new(Vec::new()) };
}

impl State {
    /// Install `f` as the hook of this thread, replacing any previous one.
    /// An empty mask uninstalls instead. `count` only matters with
    /// [`HookMask::COUNT`].
    pub fn set_hook<F>(&mut self, mask: HookMask, count: u32, f: F)
    where
        F: Fn(&mut State, &mut Debug<'_>) -> Result<()> + Send + Sync + 'static,
    {
        if mask.is_empty() {
            self.unset_hook();
            return;
        }
        self.install_hook(HookEntry {
            main: self.main_thread() as usize,
            mask,
            count: i32::try_from(count).unwrap_or(i32::MAX),
            func: Arc::new(f),
        });
    }

    /// Remove the hook of this thread.
    pub fn unset_hook(&mut self) {
        HOOKS.remove(&(self.raw() as usize));
        unsafe { ffi::lua_sethook(self.raw(), None, 0, 0) };
    }

    /// Whether this thread has a hook installed.
    pub fn has_hook(&self) -> bool {
        HOOKS.contains_key(&(self.raw() as usize))
    }

    fn install_hook(&mut self, entry: HookEntry) {
        let (mask, count) = (entry.mask.bits(), entry.count);
        HOOKS.insert(self.raw() as usize, entry);
        unsafe { ffi::lua_sethook(self.raw(), Some(dispatch), mask, count) };
    }

    /// [`State::call`] under a cancellation context.
    ///
    /// A hook polling `ctx` every `ctx.check_interval()` instructions (and on
    /// every new line) is installed for the duration of the call; the hook
    /// that was there before is restored afterwards. When `ctx` fires, the
    /// script aborts with [`Error::Cancelled`] traced at the running line.
    pub fn call_with_context(&mut self, ctx: &CancelContext, nargs: i32, nret: i32) -> Result<()> {
        if let Some(reason) = ctx.err() {
            self.pop(nargs + 1);
            return Err(reason.into());
        }

        let previous = HOOKS.get(&(self.raw() as usize)).map(|entry| entry.clone());
        let main = self.main_thread() as usize;
        let watched = ctx.clone();
        let func: HookFunction = Arc::new(move |_: &mut State, _: &mut Debug<'_>| {
            match watched.err() {
                Some(reason) => {
                    tracing::debug!("cancelling script: {reason}");
                    Err(reason.into())
                }
                None => Ok(()),
            }
        });
        self.install_hook(HookEntry {
            main,
            mask: HookMask::LINE | HookMask::COUNT,
            count: i32::try_from(ctx.check_interval()).unwrap_or(i32::MAX),
            func: func.clone(),
        });
        RUNNING.with(|running| running.borrow_mut().push((main, func)));

        let result = self.call(nargs, nret);
        RUNNING.with(|running| {
            running.borrow_mut().pop();
        });
        match previous {
            Some(entry) => self.install_hook(entry),
            None => self.unset_hook(),
        }
        result
    }
}

/// Drop every hook entry of the interpreter whose main thread is `main`.
pub(crate) fn forget_state(main: *mut ffi::lua_State) {
    let main = main as usize;
    HOOKS.retain(|_, entry| entry.main != main);
}

fn lookup(raw: *mut ffi::lua_State) -> Option<HookFunction> {
    if let Some(entry) = HOOKS.get(&(raw as usize)) {
        return Some(entry.func.clone());
    }
    let main = unsafe { main_thread_of(raw) } as usize;
    let running = RUNNING.with(|running| {
        running
            .borrow()
            .iter()
            .rev()
            .find(|(owner, _)| *owner == main)
            .map(|(_, func)| func.clone())
    });
    running.or_else(|| HOOKS.get(&main).map(|entry| entry.func.clone()))
}

unsafe extern "C-unwind" fn dispatch(raw: *mut ffi::lua_State, ar: *mut ffi::lua_Debug) {
    let Some(func) = lookup(raw) else {
        return;
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut state = unsafe { State::borrowed(raw) };
        let mut debug = unsafe { Debug::from_hook(raw, ar) };
        func(&mut state, &mut debug)
    }));
    drop(func);

    let error = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(payload) => Error::runtime(format!("hook panicked: {}", panic_message(payload.as_ref()))),
    };
    let error = trace_running(raw, error);
    unsafe { raise(raw, error) }
}

/// Trace `error` at the function the hook interrupted.
fn trace_running(raw: *mut ffi::lua_State, error: Error) -> Error {
    if matches!(error, Error::Traced(_)) {
        return error;
    }
    let mut state = unsafe { State::borrowed(raw) };
    let (chunk_name, line) = state.where_(0);
    let traceback = state.traceback(0);
    Error::traced(error, chunk_name, line, traceback)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{error::CancelReason, types::HookEvent};

    #[test]
    fn line_hook_sees_every_line() {
        let mut state = State::new().unwrap();
        let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = lines.clone();
        state.set_hook(HookMask::LINE, 0, move |_, debug| {
            assert_eq!(debug.event, Some(HookEvent::Line));
            seen.lock().unwrap().push(debug.current_line());
            Ok(())
        });

        state.do_string("local a = 1\nlocal b = 2\nlocal c = a + b").unwrap();
        state.unset_hook();
        assert_eq!(*lines.lock().unwrap(), vec![1, 2, 3]);
        assert!(!state.has_hook());
    }

    #[test]
    fn hook_error_aborts_the_script() {
        let mut state = State::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let token = CancelContext::new();
        let watched = token.clone();

        state.set_hook(HookMask::COUNT, 100, move |_, _| {
            if let Some(reason) = watched.err() {
                return Err(reason.into());
            }
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                watched.cancel();
            }
            Ok(())
        });

        let err = state.do_string("while true do end").unwrap_err();
        assert_eq!(err.cancel_reason(), Some(CancelReason::Canceled));
        assert_eq!(err.trace().unwrap().chunk_name, "<string>");
        assert_eq!(err.trace().unwrap().line, 1);
        // Cancelled on the fifth firing, raised on the sixth.
        assert_eq!(fired.load(Ordering::SeqCst), 5);
        assert!(token.is_cancelled());
    }

    #[test]
    fn context_restores_previous_hook() {
        let mut state = State::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        state.set_hook(HookMask::LINE, 0, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        state.load_string("local x = 1").unwrap();
        state.call_with_context(&CancelContext::new(), 0, 0).unwrap();
        let during = fired.load(Ordering::SeqCst);
        assert_eq!(during, 0);

        state.do_string("local y = 2").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expired_context_does_not_start() {
        let mut state = State::new().unwrap();
        let ctx = CancelContext::new();
        ctx.cancel();
        state.push_integer(0);
        state.load_string("error('unreachable')").unwrap();
        let err = state.call_with_context(&ctx, 0, 0).unwrap_err();
        assert_eq!(err.cancel_reason(), Some(CancelReason::Canceled));
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn hooks_are_forgotten_on_close() {
        let mut state = State::new().unwrap();
        state.set_hook(HookMask::LINE, 0, |_, _| Ok(()));
        let key = state.as_ptr() as usize;
        assert!(HOOKS.contains_key(&key));
        state.close();
        assert!(!HOOKS.contains_key(&key));
    }
}
