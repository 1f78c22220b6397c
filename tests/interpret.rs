use kuroko::{Vm, VmFlags};

/// Runs a program and returns everything it printed.
fn run(code: &str) -> String {
    let mut vm = Vm::new(VmFlags::default());
    vm.capture_output();
    match vm.interpret(code, "<test>") {
        Ok(_) => vm.take_output(),
        Err(e) => panic!("unexpected error: {e}\npartial output: {:?}", vm.take_output()),
    }
}

/// Runs a program expected to fail; returns the error display.
fn run_err(code: &str) -> String {
    let mut vm = Vm::new(VmFlags::default());
    vm.capture_output();
    match vm.interpret(code, "<test>") {
        Ok(v) => panic!("expected an error, got {v:?}; output: {:?}", vm.take_output()),
        Err(e) => e.to_string(),
    }
}

macro_rules! execute_output_tests {
    ($($name:ident: $code:expr, $expected:expr;)*) => {
        $(
            paste::item! {
                #[test]
                fn [< output_ $name >]() {
                    let output = run($code);
                    let expected = $expected;
                    assert_eq!(output, expected, "program: {}", $code);
                }
            }
        )*
    }
}

macro_rules! execute_error_tests {
    ($($name:ident: $code:expr, $needle:expr;)*) => {
        $(
            paste::item! {
                #[test]
                fn [< error_ $name >]() {
                    let display = run_err($code);
                    assert!(
                        display.contains($needle),
                        "expected {:?} in error {:?}",
                        $needle,
                        display
                    );
                }
            }
        )*
    }
}

// ---------------------------------------------------------------------
// Expressions and operators
// ---------------------------------------------------------------------

execute_output_tests! {
    add_ints: "print(1 + 1)", "2\n";
    add_strs: "print('a' + 'b')", "ab\n";
    precedence: "print(2 + 3 * 4)", "14\n";
    pow_right_assoc: "print(2 ** 3 ** 2)", "512\n";
    floor_division: "print(7 / 2, -7 / 2)", "3 -4\n";
    modulo_floored: "print(7 % 3, -7 % 3)", "1 2\n";
    float_math: "print(1.5 + 2.25)", "3.75\n";
    float_display: "print(4.0, 2.5)", "4.0 2.5\n";
    mixed_numeric: "print(1 + 2.5)", "3.5\n";
    bitwise: "print(6 & 3, 6 | 3, 6 ^ 3, 1 << 4, 32 >> 2, ~0)", "2 7 5 16 8 -1\n";
    unary: "print(-5, not True, not 0)", "-5 False True\n";
    comparison: "print(1 < 2, 2 <= 2, 3 > 4, 3 >= 4, 1 == 1.0, 1 != 2)",
        "True True False False True True\n";
    string_compare: "print('abc' < 'abd', 'b' > 'a')", "True True\n";
    boolean_ops: "print(True and 'yes', False or 'no', 0 and 1, 1 or 2)", "yes no 0 1\n";
    ternary: "print(1 if True else 2, 1 if False else 2)", "1 2\n";
    ternary_nested_expr: "print((10 if 1 > 2 else 20) + 1)", "21\n";
    is_identity: "let a = [1]\nlet b = a\nprint(a is b, a is [1], 3 is 3)", "True False True\n";
    in_containment: "print(2 in [1, 2], 5 in [1, 2], 'el' in 'hello', 'k' not in 'hello')",
        "True False True True\n";
    string_repeat: "print('ab' * 3, [0] * 2)", "ababab [0, 0]\n";
    string_escapes: "print('a\\tb')", "a\tb\n";
    string_concat_literals: "print('ab' 'cd')", "abcd\n";
    fstring: "let n = 5\nprint(f'n is {n}!')", "n is 5!\n";
    fstring_repr: "let q = 'val'\nprint(f'{q!r}')", "'val'\n";
    fstring_expressions: "print(f'{1 + 2}-{3 * 3}')", "3-9\n";
    hex_bin_oct_literals: "print(0x1f, 0b101, 0o17)", "31 5 15\n";
    big_string: "print('''line''')", "line\n";
}

// ---------------------------------------------------------------------
// Variables, assignment, scoping
// ---------------------------------------------------------------------

execute_output_tests! {
    global_assignment: "x = 5\nprint(x)", "5\n";
    let_declaration: "let x = 1\nprint(x)", "1\n";
    let_multi: "let a, b = 1, 2\nprint(a, b)", "1 2\n";
    let_unpack: "let a, b, c = [10, 20, 30]\nprint(a, b, c)", "10 20 30\n";
    compound_assign: "let x = 5\nx += 2\nx *= 3\nx -= 1\nprint(x)", "20\n";
    pow_assign: "let x = 5\nx **= 2\nprint(x)", "25\n";
    increment: "let x = 5\nx++\nx++\nx--\nprint(x)", "6\n";
    shift_assign: "let x = 1\nx <<= 4\nx >>= 2\nprint(x)", "4\n";
    del_global: "x = 1\ndel x\ntry:\n    print(x)\nexcept NameError:\n    print('gone')", "gone\n";
}

// ---------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------

execute_output_tests! {
    if_else: "if 1 > 2:\n    print('then')\nelse:\n    print('else')", "else\n";
    elif_chain: "let x = 2\nif x == 1:\n    print('a')\nelif x == 2:\n    print('b')\nelse:\n    print('c')", "b\n";
    while_loop: "let i = 0\nwhile i < 3:\n    print(i)\n    i += 1", "0\n1\n2\n";
    while_break: "let i = 0\nwhile True:\n    if i == 2:\n        break\n    print(i)\n    i += 1", "0\n1\n";
    while_continue: "let i = 0\nwhile i < 4:\n    i += 1\n    if i % 2 == 0:\n        continue\n    print(i)", "1\n3\n";
    for_in_list: "for x in [10, 20]:\n    print(x)", "10\n20\n";
    for_in_string: "for c in 'ab':\n    print(c)", "a\nb\n";
    for_in_range: "for i in range(3):\n    print(i)", "0\n1\n2\n";
    for_range_step: "for i in range(6, 0, -2):\n    print(i)", "6\n4\n2\n";
    for_unpack: "for a, b in [(1, 2), (3, 4)]:\n    print(a + b)", "3\n7\n";
    for_c_style: "for i = 0; i < 3; i++:\n    print(i)", "0\n1\n2\n";
    nested_loops: "for i in range(2):\n    for j in range(2):\n        print(i, j)", "0 0\n0 1\n1 0\n1 1\n";
    semicolon_statements: "print(1); print(2)", "1\n2\n";
    pass_statement: "if True:\n    pass\nprint('done')", "done\n";
}

// ---------------------------------------------------------------------
// Functions, closures, defaults, splats
// ---------------------------------------------------------------------

execute_output_tests! {
    default_args: "def f(x=10): return x\nprint(f(), f(3))", "10 3\n";
    defaults_left_to_right: "def f(a=1, b=2): return a * 10 + b\nprint(f(), f(3), f(3, 4))", "12 32 34\n";
    keyword_call: "def f(a, b=2): return a + b\nprint(f(1), f(1, 5), f(1, b=10))", "3 6 11\n";
    keyword_reorder: "def sub(a, b): return a - b\nprint(sub(b=1, a=10))", "9\n";
    star_args: "def f(*args): return len(args)\nprint(f(), f(1), f(1, 2, 3))", "0 1 3\n";
    star_splat: "def add3(a, b, c): return a + b + c\nlet args = [1, 2, 3]\nprint(add3(*args))", "6\n";
    kwargs_splat: "def add3(a, b, c): return a + b + c\nprint(add3(**{'a': 1, 'b': 2, 'c': 3}))", "6\n";
    kwargs_collector: "def f(**kwargs): return kwargs['k']\nprint(f(k=42))", "42\n";
    recursion: "def fib(n):\n    if n < 2:\n        return n\n    return fib(n - 1) + fib(n - 2)\nprint(fib(10))", "55\n";
    closure_counter: "def counter():\n    let count = 0\n    def increment():\n        count += 1\n        return count\n    return increment\nlet c = counter()\nprint(c(), c(), c())", "1 2 3\n";
    closures_independent: "def make(n):\n    def get():\n        return n\n    return get\nlet a = make(1)\nlet b = make(2)\nprint(a(), b())", "1 2\n";
    lambda_expr: "let double = lambda x: x * 2\nprint(double(21))", "42\n";
    lambda_closure: "def adder(n): return lambda x: x + n\nprint(adder(10)(5))", "15\n";
    decorator_function: "def shout(f):\n    def wrapper():\n        return f().upper()\n    return wrapper\n@shout\ndef greet():\n    return 'hello'\nprint(greet())", "HELLO\n";
    docstring_kept: "def f():\n    '''does things'''\n    return 1\nprint(f())", "1\n";
    docstring_exposed: "def f():\n    '''does things'''\n    return 1\nprint(f.__doc__)", "does things\n";
    class_docstring: "class C:\n    '''a container'''\n    pass\nprint(C.__doc__)", "a container\n";
    function_repr: "def f(): return 1\nprint(f)", "<function f>\n";
}

// ---------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------

execute_output_tests! {
    list_literal: "print([1, 2, 3])", "[1, 2, 3]\n";
    list_nested_repr: "print([1, [2, 3], 'x'])", "[1, [2, 3], 'x']\n";
    list_index: "let l = [10, 20, 30]\nprint(l[0], l[-1])", "10 30\n";
    list_assign_index: "let l = [1, 2]\nl[1] = 5\nprint(l)", "[1, 5]\n";
    list_compound_index: "let l = [1, 2]\nl[0] += 10\nprint(l)", "[11, 2]\n";
    list_slice: "let l = [1, 2, 3, 4]\nprint(l[1:3], l[:2], l[2:])", "[2, 3] [1, 2] [3, 4]\n";
    list_methods: "let l = [3, 1]\nl.append(2)\nl.sort()\nprint(l, l.index(2), l.count(1))", "[1, 2, 3] 1 1\n";
    list_pop_insert: "let l = [1, 2, 3]\nprint(l.pop(), l)\nl.insert(0, 9)\nprint(l)", "3 [1, 2]\n[9, 1, 2]\n";
    shared_list: "let a = [1]\nlet b = a\nb.append(2)\nprint(len(a))", "2\n";
    tuple_literal: "print((1, 2), (1,), ())", "(1, 2) (1,) ()\n";
    tuple_index: "let t = (1, 2, 3)\nprint(t[1], len(t))", "2 3\n";
    dict_literal: "let d = {'a': 1, 'b': 2}\nprint(d['a'], len(d), 'b' in d, 'c' in d)", "1 2 True False\n";
    dict_set_del: "let d = {}\nd['k'] = 1\nd['k'] += 1\nprint(d['k'])\ndel d['k']\nprint(len(d))", "2\n0\n";
    dict_get_default: "let d = {'a': 1}\nprint(d.get('a'), d.get('b'), d.get('b', 9))", "1 None 9\n";
    dict_iterate: "let d = {'a': 1}\nfor k in d:\n    print(k, d[k])", "a 1\n";
    dict_items_unpack: "let d = {'x': 7}\nfor k, v in d.items():\n    print(k, v)", "x 7\n";
    numeric_keys_promote: "let d = {1: 'one'}\nprint(d[1.0], d[True])", "one one\n";
    set_membership: "let s = {1, 2, 3}\nprint(len(s), 2 in s, 9 in s)", "3 True False\n";
    set_intersection: "let i = {1, 2, 3} & {2, 3, 4}\nprint(len(i), 2 in i, 3 in i, 1 in i)", "2 True True False\n";
    set_union_diff: "let u = {1, 2} | {2, 3}\nlet d = {1, 2} - {2}\nprint(len(u), len(d), 1 in d)", "3 1 True\n";
    set_add_remove: "let s = {1}\ns.add(2)\ns.discard(1)\nprint(len(s), 2 in s)", "1 True\n";
    empty_set_repr: "print(set())", "set()\n";
    bytes_literal: "let b = b'ab\\x00'\nprint(len(b), b[0], b)", "3 97 b'ab\\x00'\n";
    string_methods: "print('a,b'.split(','), ' x '.strip(), 'ab'.upper(), 'AB'.lower())",
        "['a', 'b'] x AB ab\n";
    string_join: "print('-'.join(['a', 'b', 'c']))", "a-b-c\n";
    string_index_slice: "print('hello'[1], 'hello'[-1], 'hello'[1:3])", "e o el\n";
    string_len_unicode: "print(len('héllo'), 'héllo'[1])", "5 é\n";
    builtin_misc: "print(ord('a'), chr(98), hex(255), any([0, 1]), all([1, 0]))",
        "97 b 0xff True False\n";
}

// ---------------------------------------------------------------------
// Comprehensions
// ---------------------------------------------------------------------

execute_output_tests! {
    list_comprehension: "print([x * x for x in [1, 2, 3]])", "[1, 4, 9]\n";
    list_comp_range: "print([x + 1 for x in range(4)])", "[1, 2, 3, 4]\n";
    list_comp_filter: "print([x for x in range(10) if x % 3 == 0])", "[0, 3, 6, 9]\n";
    list_comp_matches_loop: "let a = [x * 2 for x in range(5)]\nlet b = []\nfor x in range(5):\n    b.append(x * 2)\nprint(a == b)", "True\n";
    set_comprehension: "let s = {x % 2 for x in range(6)}\nprint(len(s))", "2\n";
    dict_comprehension: "let d = {x: x * x for x in range(3)}\nprint(d[0], d[1], d[2])", "0 1 4\n";
    generator_expression: "let g = (x * x for x in [1, 2, 3])\nprint([x for x in g])", "[1, 4, 9]\n";
    comp_over_captured: "let base = 10\nprint([base + x for x in [1, 2]])", "[11, 12]\n";
    comp_multi_var: "print([a + b for a, b in [(1, 2), (3, 4)]])", "[3, 7]\n";
}

// ---------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------

execute_output_tests! {
    class_repr_protocol: "class A:\n    def __init__(self, n): self.n = n\n    def __repr__(self): return f'A({self.n})'\nprint(A(5))", "A(5)\n";
    class_fields: "class P:\n    def __init__(self, x, y):\n        self.x = x\n        self.y = y\nlet p = P(1, 2)\np.x += 10\nprint(p.x, p.y)", "11 2\n";
    class_static_field: "class C:\n    limit = 10\nprint(C.limit)", "10\n";
    class_method_call: "class Greeter:\n    def greet(self, name): return 'hi ' + name\nprint(Greeter().greet('bob'))", "hi bob\n";
    inheritance: "class Animal:\n    def speak(self): return 'generic'\nclass Dog(Animal):\n    pass\nprint(Dog().speak())", "generic\n";
    override_and_super: "class Animal:\n    def speak(self): return 'generic'\nclass Dog(Animal):\n    def speak(self): return 'woof ' + super.speak()\nprint(Dog().speak())", "woof generic\n";
    isinstance_chain: "class A:\n    pass\nclass B(A):\n    pass\nlet b = B()\nprint(isinstance(b, B), isinstance(b, A), isinstance(b, object), isinstance(1, A))",
        "True True True False\n";
    isinstance_builtin: "print(isinstance(1, int), isinstance('x', str), isinstance([], list), isinstance(1, str))",
        "True True True False\n";
    eq_protocol: "class V:\n    def __init__(self, n): self.n = n\n    def __eq__(self, other): return self.n == other.n\nprint(V(1) == V(1), V(1) == V(2))", "True False\n";
    callable_instance: "class Adder:\n    def __init__(self, n): self.n = n\n    def __call__(self, x): return x + self.n\nprint(Adder(10)(5))", "15\n";
    getitem_protocol: "class Box:\n    def __getitem__(self, k): return k * 2\nprint(Box()[21])", "42\n";
    len_protocol: "class Sized:\n    def __len__(self): return 7\nprint(len(Sized()))", "7\n";
    property_decorator: "class Circle:\n    def __init__(self, r): self.r = r\n    @property\n    def area(self):\n        return self.r * self.r * 3\nprint(Circle(2).area)", "12\n";
    staticmethod_decorator: "class Math:\n    @staticmethod\n    def double(x):\n        return x * 2\nprint(Math.double(4))", "8\n";
    class_repr_builtin: "class A:\n    pass\nprint(A)", "<class 'A'>\n";
    custom_add: "class Vec:\n    def __init__(self, x): self.x = x\n    def __add__(self, other): return Vec(self.x + other.x)\n    def __repr__(self): return f'Vec({self.x})'\nprint(Vec(1) + Vec(2))", "Vec(3)\n";
    iterable_class: "class Upto:\n    def __init__(self, n): self.n = n\n    def __iter__(self):\n        let i = 0\n        let n = self.n\n        def it():\n            if i >= n:\n                return it\n            i += 1\n            return i - 1\n        return it\nprint([x for x in Upto(3)])", "[0, 1, 2]\n";
    arbitrary_attribute: "class Bag:\n    pass\nlet b = Bag()\nb.thing = 9\nprint(b.thing, getattr(b, 'missing', 'dflt'))", "9 dflt\n";
}

// ---------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------

execute_output_tests! {
    generator_next: "def gen(): yield 1; yield 2\nlet it = gen()\nprint(next(it), next(it))", "1 2\n";
    generator_for: "def gen():\n    yield 'a'\n    yield 'b'\nfor x in gen():\n    print(x)", "a\nb\n";
    generator_loop_state: "def countdown(n):\n    while n > 0:\n        yield n\n        n -= 1\nprint([x for x in countdown(3)])", "[3, 2, 1]\n";
    generator_send: "def echo():\n    let got = yield 'ready'\n    yield got\nlet g = echo()\nprint(g(), g.send('hi'))", "ready hi\n";
    generator_args: "def upto(n):\n    let i = 0\n    while i < n:\n        yield i\n        i += 1\nprint([x for x in upto(4)])", "[0, 1, 2, 3]\n";
    generator_is_lazy: "def g():\n    print('side')\n    yield 1\nlet it = g()\nprint('before')\nprint(next(it))", "before\nside\n1\n";
    generator_repr_running: "def g(): yield 1\nlet it = g()\nprint(it.gi_running)", "False\n";
}

// ---------------------------------------------------------------------
// Exceptions and context managers
// ---------------------------------------------------------------------

execute_output_tests! {
    try_except: "try:\n    raise ValueError('nope')\nexcept:\n    print('caught')", "caught\n";
    except_filter_match: "try:\n    raise ValueError('v')\nexcept ValueError as e:\n    print('caught', e)", "caught ValueError('v')\n";
    except_filter_passes_through: "try:\n    try:\n        raise ValueError('v')\n    except TypeError:\n        print('wrong')\nexcept ValueError:\n    print('right')", "right\n";
    except_filter_tuple: "try:\n    raise KeyError('k')\nexcept (ValueError, KeyError):\n    print('either')", "either\n";
    exception_fields: "try:\n    raise TypeError('msg')\nexcept TypeError as e:\n    print(e.arg)", "msg\n";
    raise_class_instantiates: "try:\n    raise TypeError\nexcept TypeError as e:\n    print(e)", "TypeError()\n";
    try_no_exception: "try:\n    print('body')\nexcept:\n    print('handler')\nprint('after')", "body\nafter\n";
    nested_unwind: "def inner():\n    raise ValueError('deep')\ndef outer():\n    inner()\ntry:\n    outer()\nexcept ValueError as e:\n    print('caught', e.arg)", "caught deep\n";
    caught_division: "try:\n    let x = 1 / 0\nexcept ZeroDivisionError:\n    print('div')", "div\n";
    caught_index: "try:\n    [1][5]\nexcept IndexError:\n    print('idx')", "idx\n";
    caught_key: "try:\n    {'a': 1}['b']\nexcept KeyError:\n    print('key')", "key\n";
    caught_attribute: "try:\n    (1).missing\nexcept AttributeError:\n    print('attr')", "attr\n";
    with_suppresses: "class C:\n    def __enter__(self): return 1\n    def __exit__(self, *a): print('x'); return True\nwith C() as v: raise ValueError()\nprint('ok')", "x\nok\n";
    with_normal_exit: "class C:\n    def __enter__(self): return 1\n    def __exit__(self, *a): print('exit'); return False\nwith C():\n    print('body')\nprint('after')", "body\nexit\nafter\n";
    with_passes_exception: "class C:\n    def __enter__(self): return 1\n    def __exit__(self, *a): print('exit'); return False\ntry:\n    with C():\n        raise ValueError('boom')\nexcept ValueError:\n    print('caught')", "exit\ncaught\n";
    with_return_runs_exit: "class C:\n    def __enter__(self): return 1\n    def __exit__(self, *a): print('exit'); return False\ndef f():\n    with C():\n        return 'res'\nprint(f())", "exit\nres\n";
    with_multiple: "class T:\n    def __init__(self, n): self.n = n\n    def __enter__(self): return self\n    def __exit__(self, *a): print('exit', self.n); return False\nwith T(1) as a, T(2) as b:\n    print('body')", "body\nexit 2\nexit 1\n";
    with_as_binds_manager: "class C:\n    def __enter__(self): return 1\n    def __exit__(self, *a): return False\nwith C() as v:\n    print(isinstance(v, C))", "True\n";
    exit_receives_exception_type: "class C:\n    def __enter__(self): return 1\n    def __exit__(self, t, v, tb): print(t is ValueError); return True\nwith C():\n    raise ValueError('z')", "True\n";
    stop_iteration_value: "def g():\n    yield 1\n    return 'final'\nlet it = g()\nnext(it)\ntry:\n    next(it)\nexcept StopIteration as e:\n    print(e.value)", "final\n";
}

execute_error_tests! {
    unhandled_raise: "raise ValueError('boom')", "ValueError";
    undefined_name: "print(missing)", "NameError";
    bad_operands: "let x = 'a' + 1", "TypeError";
    zero_division: "let x = 1 / 0", "ZeroDivisionError";
    index_out_of_range: "[1][5]", "IndexError";
    missing_key: "{'a': 1}['b']", "KeyError";
    not_callable: "let x = 5\nx()", "TypeError";
    too_few_args: "def f(a, b): return a\nf(1)", "ArgumentError";
    too_many_args: "def f(a): return a\nf(1, 2)", "ArgumentError";
    unexpected_keyword: "def f(a): return a\nf(a=1, b=2)", "TypeError";
    duplicate_keyword: "def f(a): return a\nf(1, a=2)", "TypeError";
    send_to_unstarted: "def g(): yield 1\ng().send(5)", "TypeError";
    generator_exhausted: "def g(): yield 1\nlet it = g()\nnext(it)\nnext(it)", "StopIteration";
    overflow_detected: "let x = 9223372036854775807\nx + 1", "OverflowError";
    missing_module: "import does_not_exist_anywhere", "ImportError";
    shift_negative: "1 << -1", "ValueError";
    unhashable: "hash([1])", "TypeError";
}

macro_rules! compile_error_tests {
    ($($name:ident: $code:expr, $needle:expr;)*) => {
        $(
            paste::item! {
                #[test]
                fn [< compile_error_ $name >]() {
                    let mut vm = Vm::new(VmFlags::default());
                    match vm.compile($code, "<test>") {
                        Ok(_) => panic!("expected a compile error for {:?}", $code),
                        Err(e) => {
                            let display = e.to_string();
                            assert!(
                                display.contains($needle),
                                "expected {:?} in {:?}",
                                $needle,
                                display
                            );
                        }
                    }
                }
            }
        )*
    }
}

compile_error_tests! {
    stray_character: "let x = $", "Unexpected";
    unterminated_string: "let x = 'abc", "Unterminated";
    assignment_to_literal: "1 = 2", "assignment";
    duplicate_local: "def f():\n    let x = 1\n    let x = 2", "Duplicate";
    yield_at_module_level: "yield 1", "yield";
    return_value_in_init: "class C:\n    def __init__(self):\n        return 5", "__init__";
    del_local: "def f():\n    let x = 1\n    del x", "del";
    mixed_collectors: "def f(**kw, *args): return 0", "Syntax";
}

// ---------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------

#[test]
fn import_from_search_path() {
    let code = "import kuroko\nkuroko.module_paths.append('tests/fixtures/')\nimport shapes\nprint(shapes.area(2))\nfrom shapes import TAU as t\nprint(t)";
    assert_eq!(run(code), "24\n6\n");
}

#[test]
fn module_namespace_is_separate() {
    let code = "import kuroko\nkuroko.module_paths.append('tests/fixtures/')\nTAU = 99\nimport shapes\nprint(shapes.TAU, TAU)";
    assert_eq!(run(code), "6 99\n");
}

// ---------------------------------------------------------------------
// GC behavior under stress
// ---------------------------------------------------------------------

fn run_stressed(code: &str) -> String {
    let mut vm = Vm::new(VmFlags {
        stress_gc: true,
        ..VmFlags::default()
    });
    vm.capture_output();
    match vm.interpret(code, "<stress>") {
        Ok(_) => vm.take_output(),
        Err(e) => panic!("unexpected error under gc stress: {e}"),
    }
}

#[test]
fn stress_gc_preserves_live_data() {
    let code = "let keep = []\nfor i in range(50):\n    keep.append('x' * 5 + str(i))\nprint(len(keep), keep[0], keep[49])";
    assert_eq!(run_stressed(code), "50 xxxxx0 xxxxx49\n");
}

#[test]
fn stress_gc_with_closures_and_classes() {
    let code = "class Node:\n    def __init__(self, v): self.v = v\ndef make(v):\n    let n = Node(v)\n    def get():\n        return n.v\n    return get\nlet fns = [make(i) for i in range(10)]\nprint(fns[0](), fns[9]())";
    assert_eq!(run_stressed(code), "0 9\n");
}

#[test]
fn explicit_collect_keeps_reachable() {
    let mut vm = Vm::new(VmFlags::default());
    vm.capture_output();
    vm.interpret("let data = [1, 2, 3]", "<t>").unwrap();
    vm.collect();
    vm.collect();
    vm.interpret("print(data)", "<t>").unwrap();
    assert_eq!(vm.take_output(), "[1, 2, 3]\n");
}

// ---------------------------------------------------------------------
// Embedding API
// ---------------------------------------------------------------------

#[test]
fn call_value_from_embedding() {
    let mut vm = Vm::new(VmFlags::default());
    vm.interpret("def add(a, b): return a + b", "<t>").unwrap();
    let function = vm.get_global("add").expect("defined above");
    let result = vm
        .call(function, vec![kuroko::Value::Int(2), kuroko::Value::Int(3)])
        .unwrap();
    assert_eq!(result, kuroko::Value::Int(5));
}

#[test]
fn repr_round_trips_primitives() {
    let mut vm = Vm::new(VmFlags::default());
    vm.capture_output();
    let code = "print(repr(None), repr(True), repr(3), repr(2.5), repr('a\\'b'))";
    vm.interpret(code, "<t>").unwrap();
    assert_eq!(vm.take_output(), "None True 3 2.5 \"a'b\"\n");
}

#[test]
fn interned_strings_share_identity() {
    let mut vm = Vm::new(VmFlags::default());
    let a = vm.copy_string("hello world");
    let b = vm.copy_string("hello world");
    assert_eq!(a, b);
    vm.capture_output();
    vm.interpret("print('ab' + 'c' is 'a' + 'bc')", "<t>").unwrap();
    assert_eq!(vm.take_output(), "True\n");
}

#[test]
fn call_trace_records_returns() {
    let mut vm = Vm::new(VmFlags::default());
    vm.capture_output();
    vm.start_call_trace();
    vm.interpret("def f():\n    return 1\nf()", "<t>").unwrap();
    let trace = vm.take_call_trace();
    let line = trace.lines().next().expect("one call returned");
    let fields: Vec<&str> = line.split(' ').collect();
    assert_eq!(fields.len(), 7, "line: {line:?}");
    assert_eq!(&fields[..2], ["<t>", "<module>"]);
    assert_eq!(&fields[3..5], ["<t>", "f"]);
    assert!(fields[6].parse::<u128>().is_ok());
}

#[test]
fn compile_is_idempotent() {
    let source = "def f(a, b=1):\n    return a + b\nclass C:\n    def m(self): return f(1)\n";
    let mut vm = Vm::new(VmFlags::default());
    let first = vm.compile(source, "<t>").unwrap();
    let first_disasm = vm.disassemble(first).unwrap();
    let second = vm.compile(source, "<t>").unwrap();
    let second_disasm = vm.disassemble(second).unwrap();
    assert_eq!(first_disasm, second_disasm);
}
