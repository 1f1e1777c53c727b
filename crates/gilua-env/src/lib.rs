#![warn(missing_docs)]

//! Share one `gilua` interpreter between many host threads.
//!
//! An [`Environment`] owns the interpreter and guards it with a single lock.
//! Scripts run on tokio's blocking pool; host functions release the lock
//! around blocking work, and background work (timers, I/O completions)
//! calls back into scripts through pinned [`Callback`]s. Every environment
//! provides a capturing `print` and a `time` module.
//!
//! ```no_run
//! use gilua_env::{EnvConfig, Environment};
//!
//! # async fn demo() -> gilua_env::Result<()> {
//! let env = Environment::new(EnvConfig::default())?;
//! let values = env.run_string("main", "time.sleep(10); return 1 + 1").await?;
//! assert_eq!(values, vec![gilua::Value::Integer(2)]);
//! env.close().await?;
//! # Ok(())
//! # }
//! ```

mod callback;
mod config;
mod engine;
mod environment;
mod error;
mod gil;
mod time;

pub use callback::Callback;
pub use config::EnvConfig;
pub use environment::Environment;
pub use error::{Error, ErrorReport, EvalOutcome, Result};
