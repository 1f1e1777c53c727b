use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use gilua::{CancelContext, MULTRET, RegistryRef, State, Thread, Type, Value, ffi};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::task::TaskTracker;

use crate::{
    callback::Callback,
    config::EnvConfig,
    engine,
    error::{Error, ErrorReport, EvalOutcome, Result},
    gil::Gil,
};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Contexts of the sessions running on this thread, innermost last.
    static CONTEXTS: RefCell<Vec<(usize, CancelContext)>> = const { RefCell::new(Vec::new()) };
}

struct ContextScope;

impl ContextScope {
    fn enter(env: usize, ctx: CancelContext) -> Self {
        CONTEXTS.with(|contexts| contexts.borrow_mut().push((env, ctx)));
        Self
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CONTEXTS.with(|contexts| {
            contexts.borrow_mut().pop();
        });
    }
}

/// Pointer to an interpreter thread, shared between host threads.
#[derive(Clone, Copy)]
struct RawState(*mut ffi::lua_State);

// SAFETY: the pointer is only turned into a view by the thread holding the
// interpreter lock.
unsafe impl Send for RawState {}
unsafe impl Sync for RawState {}

impl RawState {
    fn of(state: &State) -> Self {
        Self(state.as_ptr())
    }

    /// # Safety
    /// The caller holds the interpreter lock and the state is not closed.
    unsafe fn view(self) -> State {
        unsafe { State::from_ptr(self.0) }
    }
}

/// The interpreter and the idle thread new session threads are created from.
/// Fields drop in order: the spawner's anchor goes before the interpreter.
struct Owned {
    _spawner: Thread,
    _state: State,
}

// SAFETY: only dropped, and only under the interpreter lock or once no
// other reference to the environment remains.
unsafe impl Send for Owned {}

pub(crate) struct Shared {
    id: usize,
    config: EnvConfig,
    gil: Gil,
    main: RawState,
    spawner: RawState,
    owned: Mutex<Option<Owned>>,
    root: CancelContext,
    tracker: TaskTracker,
    runtime: Handle,
    logs: Mutex<VecDeque<String>>,
    released: Mutex<Vec<RegistryRef>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    pub(crate) fn release_later(&self, reference: RegistryRef) {
        lock(&self.released).push(reference);
    }

    fn release_pending(&self, state: &mut State) {
        let pending = std::mem::take(&mut *lock(&self.released));
        for reference in pending {
            state.unreference(reference);
        }
    }

    pub(crate) fn push_log(&self, line: String) {
        if self.config.echo_print {
            tracing::info!(target: "gilua_env::print", "{line}");
        }
        let mut logs = lock(&self.logs);
        logs.push_back(line);
        while logs.len() > self.config.max_log_lines {
            logs.pop_front();
        }
    }

    fn run_context(&self) -> CancelContext {
        let ctx = self
            .root
            .child()
            .with_check_interval(self.config.check_interval);
        match self.config.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    /// Enter a session on a fresh private thread.
    fn with_thread<R>(
        &self,
        ctx: CancelContext,
        f: impl FnOnce(&mut State, &CancelContext) -> gilua::Result<R>,
    ) -> Result<R> {
        let _session = self.gil.enter()?;
        // SAFETY: the lock is held and the state outlives every session.
        let mut spawner = unsafe { self.spawner.view() };
        self.release_pending(&mut spawner);

        let mut thread = spawner.new_thread();
        let _scope = ContextScope::enter(self.id, ctx.clone());
        let result = f(&mut thread, &ctx);
        drop(thread);
        Ok(result?)
    }

    fn shutdown(&self) {
        let closed = self.gil.shutdown(|| {
            let owned = lock(&self.owned).take();
            drop(owned);
        });
        if closed.is_some() {
            tracing::debug!(env = self.id, "environment closed");
        }
    }
}

/// Call the function below `nargs` arguments and collect its results,
/// leaving the stack as it was before the function was pushed.
fn call_collect(
    state: &mut State,
    ctx: &CancelContext,
    nargs: i32,
    nret: i32,
) -> gilua::Result<Vec<Value>> {
    let base = state.get_top() - nargs - 1;
    state.call_with_context(ctx, nargs, nret)?;
    let values = (base + 1..=state.get_top())
        .map(|i| state.to_any(i))
        .collect();
    state.set_top(base);
    Ok(values)
}

/// One interpreter shared by every thread of the host, one at a time.
///
/// Cloning yields another handle to the same interpreter. Work enters the
/// interpreter as a *session* holding the interpreter lock: [`exec`] on the
/// calling thread, [`run_string`] and friends on the blocking pool, and
/// [`invoke`] for script callbacks fired by background work. Host functions
/// release the lock around blocking work with [`async_run`] or
/// [`block_on`], and hand it to waiting threads with [`yield_now`].
///
/// [`exec`]: Environment::exec
/// [`run_string`]: Environment::run_string
/// [`invoke`]: Environment::invoke
/// [`async_run`]: Environment::async_run
/// [`block_on`]: Environment::block_on
/// [`yield_now`]: Environment::yield_now
#[derive(Clone)]
pub struct Environment {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.shared.id)
            .field("closed", &self.shared.gil.is_closed())
            .finish()
    }
}

impl Environment {
    /// Create an interpreter with `print` capture and the `time` module.
    /// Must be called inside a tokio runtime, which hosts the environment's
    /// background work.
    pub fn new(config: EnvConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let mut state = State::new()?;
        let spawner = state.new_thread();
        let main = RawState::of(&state);
        let spawner_raw = RawState::of(&spawner);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        let mut installed = Ok(());
        let shared = Arc::new_cyclic(|env: &Weak<Shared>| {
            installed = engine::install(&mut state, env);
            Shared {
                id,
                config,
                gil: Gil::default(),
                main,
                spawner: spawner_raw,
                owned: Mutex::new(Some(Owned {
                    _spawner: spawner,
                    _state: state,
                })),
                root: CancelContext::new(),
                tracker: TaskTracker::new(),
                runtime,
                logs: Mutex::new(VecDeque::new()),
                released: Mutex::new(Vec::new()),
            }
        });
        installed?;
        tracing::debug!(env = id, "environment created");
        Ok(Self { shared })
    }

    pub(crate) fn upgrade(env: &Weak<Shared>) -> gilua::Result<Self> {
        env.upgrade()
            .map(|shared| Self { shared })
            .ok_or(gilua::Error::Closed)
    }

    /// The configuration the environment was created with.
    pub fn config(&self) -> &EnvConfig {
        &self.shared.config
    }

    /// Whether [`Environment::close`] has destroyed the interpreter.
    pub fn is_closed(&self) -> bool {
        self.shared.gil.is_closed()
    }

    /// Run `f` on the interpreter's main thread, holding the lock.
    ///
    /// Blocks until the lock is free. Fails with [`Error::Reentrant`] when the
    /// calling thread already holds it, for example from inside a host
    /// function, and with [`Error::Closed`] once closing has begun.
    pub fn exec<R>(&self, f: impl FnOnce(&mut State) -> R) -> Result<R> {
        let _session = self.shared.gil.enter()?;
        // SAFETY: the lock is held and the state outlives every session.
        let mut state = unsafe { self.shared.main.view() };
        self.shared.release_pending(&mut state);
        Ok(f(&mut state))
    }

    /// Compile and run `code` as a chunk named `name`, returning its results.
    pub async fn run_string(&self, name: &str, code: &str) -> Result<Vec<Value>> {
        let (name, code) = (name.to_string(), code.to_string());
        self.run(move |state, ctx| {
            state.load_buffer(&code, &name)?;
            call_collect(state, ctx, 0, MULTRET)
        })
        .await
    }

    /// Compile and run the file at `path`, returning its results.
    pub async fn run_file(&self, path: impl AsRef<Path>) -> Result<Vec<Value>> {
        let path = path.as_ref().to_path_buf();
        self.run(move |state, ctx| {
            state.load_file(&path)?;
            call_collect(state, ctx, 0, MULTRET)
        })
        .await
    }

    /// Like [`Environment::run_string`], with `args` visible to the chunk as
    /// its first vararg and as the global `arg`.
    pub async fn run_with_args(
        &self,
        name: &str,
        code: &str,
        args: serde_json::Value,
    ) -> Result<Vec<Value>> {
        let (name, code) = (name.to_string(), code.to_string());
        let args = Value::from(args);
        self.run(move |state, ctx| {
            state.push_any(&args);
            state.set_global("arg")?;
            state.load_buffer(&code, &name)?;
            state.push_any(&args);
            call_collect(state, ctx, 1, MULTRET)
        })
        .await
    }

    /// Run `code` and package its results, the `print` output captured
    /// meanwhile and any error into one serializable value.
    ///
    /// Captured lines are taken from the shared log, so output of other
    /// sessions running at the same time lands here too.
    pub async fn eval(&self, name: &str, code: &str) -> EvalOutcome {
        let result = self.run_string(name, code).await;
        let logs = self.take_logs();
        match result {
            Ok(values) => EvalOutcome {
                values: values
                    .iter()
                    .map(|value| {
                        serde_json::to_value(value)
                            .unwrap_or_else(|err| serde_json::Value::String(err.to_string()))
                    })
                    .collect(),
                logs,
                error: None,
            },
            Err(err) => EvalOutcome {
                values: Vec::new(),
                logs,
                error: Some(ErrorReport::from(&err)),
            },
        }
    }

    async fn run<F>(&self, f: F) -> Result<Vec<Value>>
    where
        F: FnOnce(&mut State, &CancelContext) -> gilua::Result<Vec<Value>> + Send + 'static,
    {
        let shared = self.shared.clone();
        let ctx = shared.run_context();
        self.shared
            .tracker
            .spawn_blocking_on(move || shared.with_thread(ctx, f), &self.shared.runtime)
            .await?
    }

    /// Let a thread waiting for the lock run, then take the lock back. A
    /// no-op when nobody is waiting or the calling thread does not hold the
    /// lock. The stack of the calling session is untouched.
    pub fn yield_now(&self) {
        self.shared.gil.yield_now();
    }

    /// Run blocking `work` with the lock released. `work` must not touch the
    /// interpreter. Its error is raised as a script error located at the
    /// caller of the running host function.
    pub fn async_run<T, E>(
        &self,
        state: &mut State,
        work: impl FnOnce() -> std::result::Result<T, E>,
    ) -> gilua::Result<T>
    where
        E: Into<gilua::Error>,
    {
        let result = {
            let _released = self.shared.gil.suspend();
            work()
        };
        result.map_err(|err| state.error(1, err))
    }

    /// Drive `future` to completion on the environment's runtime with the
    /// lock released. Like [`Environment::async_run`]; must be called from a
    /// session thread, never from inside an async task.
    pub fn block_on<T, E, F>(&self, state: &mut State, future: F) -> gilua::Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<gilua::Error>,
    {
        let runtime = self.shared.runtime.clone();
        self.async_run(state, move || runtime.block_on(future))
    }

    /// Pin the function at `index` so background work can call it later.
    pub fn callback(&self, state: &mut State, index: i32) -> gilua::Result<Callback> {
        state.check_type(index, Type::Function)?;
        let reference = state.reference(index);
        Ok(Callback::new(reference, Arc::downgrade(&self.shared)))
    }

    /// Pin the global function `name`.
    pub fn global_callback(&self, name: &str) -> Result<Callback> {
        let env = Arc::downgrade(&self.shared);
        let pinned = self.exec(|state| {
            let typ = state.get_global(name)?;
            if typ != Type::Function {
                state.pop(1);
                return Err(gilua::Error::runtime(format!(
                    "global '{name}' is not a function (got {typ})"
                )));
            }
            let reference = state.reference(-1);
            state.pop(1);
            Ok(Callback::new(reference, env))
        })?;
        Ok(pinned?)
    }

    /// Call `callback` with `args` on a private thread and return up to
    /// `nret` results ([`MULTRET`] for all). Blocks until the lock is free.
    pub fn invoke(&self, callback: &Callback, args: &[Value], nret: i32) -> Result<Vec<Value>> {
        if !callback.belongs_to(&self.shared) {
            return Err(gilua::Error::runtime("callback belongs to another environment").into());
        }
        let ctx = self.shared.run_context();
        self.shared.with_thread(ctx, |state, ctx| {
            let Some(reference) = callback.reference() else {
                return Err(gilua::Error::runtime("callback was released"));
            };
            let nargs = i32::try_from(args.len())
                .map_err(|_| gilua::Error::runtime("too many callback arguments"))?;
            if !state.check_stack(nargs + 1) {
                return Err(gilua::Error::runtime("stack overflow pushing callback arguments"));
            }
            state.push_reference(reference);
            for arg in args {
                state.push_any(arg);
            }
            call_collect(state, ctx, nargs, nret)
        })
    }

    /// [`Environment::invoke`] on the blocking pool. The invocation is
    /// tracked: [`Environment::close`] waits for it.
    pub fn spawn_invoke(
        &self,
        callback: Callback,
        args: Vec<Value>,
        nret: i32,
    ) -> JoinHandle<Result<Vec<Value>>> {
        let env = self.clone();
        self.shared.tracker.spawn_blocking_on(
            move || env.invoke(&callback, &args, nret),
            &self.shared.runtime,
        )
    }

    /// Spawn `task` on the environment's runtime, tracked so that
    /// [`Environment::close`] waits for it.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.shared.tracker.spawn_on(task, &self.shared.runtime)
    }

    /// Captured `print` lines, oldest first.
    pub fn logs(&self) -> Vec<String> {
        lock(&self.shared.logs).iter().cloned().collect()
    }

    /// Captured `print` lines, clearing the log.
    pub fn take_logs(&self) -> Vec<String> {
        lock(&self.shared.logs).drain(..).collect()
    }

    /// Context of the session running on the calling thread, or the
    /// environment's root context outside any run.
    pub fn context(&self) -> CancelContext {
        let id = self.shared.id;
        CONTEXTS
            .with(|contexts| {
                contexts
                    .borrow()
                    .iter()
                    .rev()
                    .find(|(env, _)| *env == id)
                    .map(|(_, ctx)| ctx.clone())
            })
            .unwrap_or_else(|| self.shared.root.clone())
    }

    pub(crate) fn root_context(&self) -> CancelContext {
        self.shared.root.clone()
    }

    /// Cancel every run, wait for tracked background work, then destroy the
    /// interpreter under the lock. Idempotent.
    ///
    /// Must not be awaited from inside a session: closing waits for every
    /// session to leave.
    pub async fn close(&self) -> Result<()> {
        if self.shared.gil.is_closed() {
            return Ok(());
        }
        tracing::debug!(env = self.shared.id, "closing environment");
        self.shared.root.cancel();
        self.shared.gil.begin_close();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.shutdown()).await?;
        Ok(())
    }
}
