//! Host functions called from scripts: argument passing, results, closure
//! lifetimes, panics and the helper setters.
#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use gilua::{
        ErrorKind, HostFunction, State, Type, Value,
        testutils::{capture_print, eval, eval_values, new_state},
    };
    use pretty_assertions::assert_eq;

    #[test]
    fn arguments_and_results() {
        let mut state = new_state();
        state.push_function(|state: &mut State| {
            let count = state.get_top();
            let mut total = 0;
            for i in 1..=count {
                total += state.check_integer(i)?;
            }
            state.push_integer(total);
            state.push_integer(count.into());
            Ok(2)
        });
        state.set_global("sum").unwrap();

        assert_eq!(
            eval_values(&mut state, "return sum(1, 2, 3)"),
            vec![Value::Integer(6), Value::Integer(3)]
        );
        assert_eq!(
            eval_values(&mut state, "return sum()"),
            vec![Value::Integer(0), Value::Integer(0)]
        );
        assert_eq!(state.get_top(), 0);
    }

    #[test]
    fn host_function_sees_only_its_frame() {
        let mut state = new_state();
        state.push_integer(1000);
        state.push_function(|state: &mut State| {
            assert_eq!(state.get_top(), 1);
            assert_eq!(state.to_string(1), "only");
            Ok(0)
        });
        state.push_string("only");
        state.call(1, 0).unwrap();
        assert_eq!(state.get_top(), 1);
        assert_eq!(state.to_integer(1), 1000);
    }

    #[test]
    fn closures_are_released_when_collected() {
        let mut state = new_state();
        let captured = Arc::new(());
        let inner = captured.clone();
        state.push_function(move |_| {
            let _keep = &inner;
            Ok(0)
        });
        state.set_global("f").unwrap();
        assert_eq!(Arc::strong_count(&captured), 2);

        state.do_string("f(); f = nil; collectgarbage(); collectgarbage()").unwrap();
        assert_eq!(Arc::strong_count(&captured), 1);
    }

    #[test]
    fn closing_releases_closures() {
        let mut state = new_state();
        let captured = Arc::new(());
        let inner = captured.clone();
        state.push_function(move |_| {
            let _keep = &inner;
            Ok(0)
        });
        state.set_global("f").unwrap();
        state.close();
        assert_eq!(Arc::strong_count(&captured), 1);
    }

    #[test]
    fn panics_become_script_errors() {
        let mut state = new_state();
        state.push_function(|_: &mut State| panic!("kaboom"));
        state.set_global("explode").unwrap();

        let err = state.do_string("\nexplode()").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(err.message(), "host function panicked: kaboom");
        assert_eq!(err.one_line(), "<string>:2: host function panicked: kaboom");

        assert_eq!(
            eval(
                &mut state,
                "local ok, msg = pcall(function() explode() end); return msg"
            ),
            Value::from("<string>:1: host function panicked: kaboom")
        );
    }

    #[test]
    fn claiming_too_many_results_is_an_error() {
        let mut state = new_state();
        state.push_function(|state: &mut State| {
            state.push_integer(1);
            Ok(5)
        });
        state.set_global("liar").unwrap();

        let err = state.do_string("liar()").unwrap_err();
        assert_eq!(
            err.message(),
            "host function returned 5 results with 1 values on the stack"
        );
    }

    #[test]
    fn argument_errors_name_the_function() {
        let mut state = new_state();
        state.push_function(|state: &mut State| {
            let n = state.check_integer(1)?;
            state.push_integer(n * 2);
            Ok(1)
        });
        state.set_global("double").unwrap();

        let err = state.do_string("double('x')").unwrap_err();
        assert_eq!(
            err.one_line(),
            "<string>:1: bad argument #1 to 'double' (integer expected, got string)"
        );

        let err = state.do_string("double(1.5)").unwrap_err();
        assert_eq!(
            err.message(),
            "bad argument #1 to 'double' (integer expected, got number)"
        );
    }

    #[test]
    fn check_helpers() {
        let mut state = new_state();
        state.push_function(|state: &mut State| {
            let flag = state.check_boolean(1)?;
            let ratio = state.check_number(2)?;
            let name = state.check_string(3)?;
            state.check_type(4, Type::Table)?;
            state.push_string(format!("{flag} {ratio} {name}"));
            Ok(1)
        });
        state.set_global("describe").unwrap();

        assert_eq!(
            eval(&mut state, "return describe(true, 2, 'n', {})"),
            Value::from("true 2 n")
        );
        let err = state.do_string("describe(true, 2, 'n')").unwrap_err();
        assert_eq!(
            err.message(),
            "bad argument #4 to 'describe' (table expected, got no value)"
        );
        let err = state.do_string("describe(1)").unwrap_err();
        assert_eq!(
            err.message(),
            "bad argument #1 to 'describe' (boolean expected, got number)"
        );
    }

    #[test]
    fn module_tables() {
        let mut state = new_state();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut funcs: HashMap<&str, HostFunction> = HashMap::new();
        let counter = calls.clone();
        funcs.insert(
            "bump",
            Arc::new(move |_: &mut State| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            }),
        );
        funcs.insert(
            "answer",
            Arc::new(|state: &mut State| {
                state.push_integer(42);
                Ok(1)
            }),
        );

        state.create_table(0, 8);
        state.set_functions(-1, funcs).unwrap();
        state.set_boolean_field(-1, "enabled", true).unwrap();
        state.set_integer_field(-1, "limit", 10).unwrap();
        state.set_number_field(-1, "ratio", 0.5).unwrap();
        state.set_string_field(-1, "name", "mod").unwrap();
        state.set_nil_field(-1, "missing").unwrap();
        state.set_global("mod").unwrap();
        assert_eq!(state.get_top(), 0);

        assert_eq!(
            eval_values(
                &mut state,
                "mod.bump(); mod.bump(); return mod.answer(), mod.enabled, mod.limit, mod.ratio, mod.name, mod.missing"
            ),
            vec![
                Value::Integer(42),
                Value::Boolean(true),
                Value::Integer(10),
                Value::Number(0.5),
                Value::from("mod"),
                Value::Nil,
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn globals_and_fields() {
        let mut state = new_state();
        state.push_integer(7);
        state.set_global("seven").unwrap();
        assert_eq!(state.get_global("seven").unwrap(), Type::Number);
        assert_eq!(state.to_integer(-1), 7);
        state.pop(1);
        assert_eq!(state.get_global("nothing").unwrap(), Type::Nil);
        state.pop(1);

        state.create_table(2, 0);
        state.push_string("first");
        state.set_i(-2, 1).unwrap();
        assert_eq!(state.get_i(-1, 1).unwrap(), Type::String);
        state.pop(1);
        assert_eq!(state.len(-1).unwrap(), 1);

        state.push_nil();
        let mut keys = Vec::new();
        while state.next(1) {
            keys.push(state.to_any(-2));
            state.pop(1);
        }
        assert_eq!(keys, vec![Value::Integer(1)]);
        assert_eq!(state.get_top(), 1);
    }

    #[test]
    fn print_capture_helper() {
        let mut state = new_state();
        capture_print(&mut state);
        state.do_string("print('a', 1, nil); print()").unwrap();
        assert_eq!(
            eval(&mut state, "return output"),
            Value::Array(vec!["a\t1\tnil".into(), "".into()])
        );
    }

    const RAISING: &str = r#"
        raising = setmetatable({}, {
            __index = function() error("no field") end,
            __newindex = function() error("read only") end,
            __len = function() error("no length") end,
            __tostring = function() error("no text") end,
        })
    "#;

    #[test]
    fn raising_metamethods_do_not_leak_host_functions() {
        let mut state = new_state();
        state.do_string(RAISING).unwrap();
        let show: HostFunction = Arc::new(|state: &mut State| {
            let text = state.try_to_string(1)?;
            state.push_string(text);
            Ok(1)
        });
        state.push_host_function(show.clone());
        state.set_global("show").unwrap();
        let before = Arc::strong_count(&show);

        let values = eval_values(
            &mut state,
            "local failures = 0\n\
             for _ = 1, 10 do\n\
               local ok, err = pcall(show, raising)\n\
               if not ok and tostring(err):find('no text') then failures = failures + 1 end\n\
             end\n\
             return failures, show('plain')",
        );
        assert_eq!(values, vec![Value::Integer(10), "plain".into()]);
        assert_eq!(Arc::strong_count(&show), before);
    }

    #[test]
    fn raising_metamethods_become_errors() {
        let mut state = new_state();
        state.do_string(RAISING).unwrap();
        assert_eq!(state.get_global("raising").unwrap(), Type::Table);

        let err = state.get_field(1, "x").unwrap_err();
        assert!(err.to_string().contains("no field"), "{err}");
        let err = state.get_i(1, 1).unwrap_err();
        assert!(err.to_string().contains("no field"), "{err}");
        assert_eq!(state.get_top(), 1);

        state.push_integer(1);
        let err = state.set_field(1, "x").unwrap_err();
        assert!(err.to_string().contains("read only"), "{err}");
        state.push_integer(1);
        let err = state.set_i(1, 1).unwrap_err();
        assert!(err.to_string().contains("read only"), "{err}");
        assert_eq!(state.get_top(), 1);

        let err = state.len(1).unwrap_err();
        assert!(err.to_string().contains("no length"), "{err}");
        let err = state.try_to_string(1).unwrap_err();
        assert!(err.to_string().contains("no text"), "{err}");
        assert!(state.to_string(1).starts_with("table: "));
        assert_eq!(state.get_top(), 1);

        state.do_string("setmetatable(_G, {__newindex = function() error('frozen') end})").unwrap();
        state.push_integer(1);
        let err = state.set_global("fresh").unwrap_err();
        assert!(err.to_string().contains("frozen"), "{err}");
        assert_eq!(state.get_top(), 1);
    }
}
