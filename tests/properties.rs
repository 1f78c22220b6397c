//! Property tests for the algebraic laws the language guarantees.

use kuroko::{Vm, VmFlags};
use proptest::prelude::*;

fn run(code: &str) -> String {
    let mut vm = Vm::new(VmFlags::default());
    vm.capture_output();
    match vm.interpret(code, "<prop>") {
        Ok(_) => vm.take_output(),
        Err(e) => panic!("unexpected error: {e}\nprogram: {code}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Equal numbers hash alike across the int/float divide.
    #[test]
    fn equal_numbers_hash_alike(a in any::<i32>()) {
        let code = format!("print({a} == {a}.0, hash({a}) == hash({a}.0))");
        prop_assert_eq!(run(&code), "True True\n");
    }

    /// Equal strings are the same object (interning) and hash alike.
    #[test]
    fn equal_strings_are_identical(s in "[a-z]{0,12}") {
        let code = format!(
            "let a = '{s}' + 'x'\nlet b = '{s}x'\nprint(a is b, hash(a) == hash(b))"
        );
        prop_assert_eq!(run(&code), "True True\n");
    }

    /// A comprehension equals the explicit append loop over the same input.
    #[test]
    fn comprehension_matches_loop(xs in prop::collection::vec(-100i64..100, 0..20)) {
        let literal = xs
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let code = format!(
            "let xs = [{literal}]\nlet a = [x * x for x in xs]\nlet b = []\nfor x in xs:\n    b.append(x * x)\nprint(a == b, len(a))"
        );
        prop_assert_eq!(run(&code), format!("True {}\n", xs.len()));
    }

    /// repr of an int is its decimal rendering.
    #[test]
    fn repr_int(a in any::<i32>()) {
        let code = format!("print(repr({a}))");
        prop_assert_eq!(run(&code), format!("{a}\n"));
    }

    /// Floored div/mod stay consistent: (a / b) * b + a % b == a.
    #[test]
    fn divmod_identity(a in -10_000i64..10_000, b in prop::sample::select(vec![-7i64, -2, 1, 3, 10])) {
        let code = format!("print(({a} / {b}) * {b} + {a} % {b} == {a})");
        prop_assert_eq!(run(&code), "True\n");
    }
}
