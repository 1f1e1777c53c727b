//! Lock exclusivity and hand-off under concurrent load.
//!
//! The xtask `stress` command runs this file repeatedly.
#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        thread,
        time::{Duration, Instant},
    };

    use gilua::{State, Value};
    use gilua_env::{EnvConfig, Environment};
    use pretty_assertions::assert_eq;
    use tracing_subscriber::fmt;

    fn quiet() -> EnvConfig {
        EnvConfig {
            echo_print: false,
            ..EnvConfig::default()
        }
    }

    /// Register `probe()`, which records whether any other thread was inside
    /// the interpreter at the same time.
    fn install_probe(env: &Environment, inside: Arc<AtomicUsize>, overlapped: Arc<AtomicBool>) {
        env.exec(move |state| {
            state.push_function(move |_: &mut State| {
                if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                for _ in 0..200 {
                    std::hint::spin_loop();
                }
                inside.fetch_sub(1, Ordering::SeqCst);
                Ok(0)
            });
            state.set_global("probe").unwrap();
        })
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn background_invocations_never_overlap() {
        let _ = fmt().with_test_writer().try_init();
        let env = Environment::new(quiet()).unwrap();
        let inside = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        install_probe(&env, inside.clone(), overlapped.clone());

        env.run_string(
            "setup",
            "function background(n)\n  probe()\n  print('bg ' .. n)\n  probe()\nend",
        )
        .await
        .unwrap();
        let callback = env.global_callback("background").unwrap();

        let main = {
            let env = env.clone();
            tokio::spawn(async move {
                env.run_string(
                    "main",
                    "for i = 1, 200 do\n  probe()\n  print('main ' .. i)\n  time.now()\nend",
                )
                .await
            })
        };
        let invocations: Vec<_> = (0..64)
            .map(|n| env.spawn_invoke(callback.clone(), vec![Value::Integer(n)], 0))
            .collect();

        main.await.unwrap().unwrap();
        for invocation in invocations {
            invocation.await.unwrap().unwrap();
        }

        assert!(!overlapped.load(Ordering::SeqCst));
        let logs = env.take_logs();
        assert_eq!(logs.len(), 264);
        let mains: Vec<_> = logs.iter().filter(|l| l.starts_with("main ")).collect();
        assert_eq!(mains.len(), 200);
        for (i, line) in mains.iter().enumerate() {
            assert_eq!(**line, format!("main {}", i + 1));
        }
        let mut backgrounds: Vec<i64> = logs
            .iter()
            .filter_map(|l| l.strip_prefix("bg "))
            .map(|n| n.parse().unwrap())
            .collect();
        backgrounds.sort_unstable();
        assert_eq!(backgrounds, (0..64).collect::<Vec<i64>>());

        env.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_with_sleeps_keep_their_stacks() {
        let env = Environment::new(quiet()).unwrap();
        let inside = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        install_probe(&env, inside, overlapped.clone());

        let runs: Vec<_> = (0..8)
            .map(|n| {
                let env = env.clone();
                tokio::spawn(async move {
                    let code = format!(
                        "local id, sum = {n}, 0\n\
                         for i = 1, 10 do\n  probe()\n  sum = sum + i\n  time.sleep(1)\nend\n\
                         return id, sum"
                    );
                    env.run_string("run", &code).await
                })
            })
            .collect();

        for (n, run) in runs.into_iter().enumerate() {
            assert_eq!(
                run.await.unwrap().unwrap(),
                vec![Value::Integer(n as i64), Value::Integer(55)]
            );
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn yield_leaves_the_stack_untouched() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let env = runtime.block_on(async { Environment::new(quiet()) }).unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        env.exec(|state| {
            state.push_integer(42);
            state.push_string("top");
            let depth = state.get_top();

            let other = {
                let (env, ran) = (env.clone(), ran.clone());
                thread::spawn(move || {
                    env.exec(|state| {
                        state.push_integer(7);
                        state.set_global("other").unwrap();
                        ran.store(true, Ordering::SeqCst);
                    })
                    .unwrap();
                })
            };

            let started = Instant::now();
            while !ran.load(Ordering::SeqCst) {
                assert!(started.elapsed() < Duration::from_secs(5));
                thread::sleep(Duration::from_millis(1));
                env.yield_now();
            }
            other.join().unwrap();

            assert_eq!(state.get_top(), depth);
            assert_eq!(state.to_string(-1), "top");
            assert_eq!(state.to_integer(-2), 42);
            state.set_top(0);
        })
        .unwrap();

        let other = env
            .exec(|state| {
                state.get_global("other").unwrap();
                let n = state.to_integer(-1);
                state.pop(1);
                n
            })
            .unwrap();
        assert_eq!(other, 7);
        runtime.block_on(env.close()).unwrap();
    }

    #[test]
    fn yield_without_waiters_keeps_the_lock() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let env = runtime.block_on(async { Environment::new(quiet()) }).unwrap();
        env.yield_now();
        let top = env
            .exec(|state| {
                state.push_boolean(true);
                env.yield_now();
                let top = state.get_top();
                state.pop(1);
                top
            })
            .unwrap();
        assert_eq!(top, 1);
    }
}
