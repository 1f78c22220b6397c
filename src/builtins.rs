//! The builtin module: base classes, their native methods, and the global
//! functions.
//!
//! Builtin types follow the same protocol machinery as user classes: their
//! behavior hangs off native methods registered in the class method tables
//! and cached by `finalize_class`, so `[1] + [1]`, `str(x)` and `for x in d`
//! all go through exactly the paths user-defined `__add__`/`__init__`/
//! `__iter__` would.
//!
//! Iterators are plain instances holding their state in fields (`l`, `i`,
//! ...) with a native `__call__`; exhaustion is signaled by returning the
//! iterator itself, which the `for` desugaring checks with `is`.

use crate::heap::{Heap, HeapData, HeapId};
use crate::objects::{ClassObj, DictObj, InstanceObj, SetObj, Special, TupleObj};
use crate::value::{values_same, Value};
use crate::vm::{format_float, BaseClasses, ExceptionClasses, Vm, VmResult};

// ---------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------

fn new_class(heap: &mut Heap, name: &str, base: Option<HeapId>) -> HeapId {
    let name_id = heap.intern(name);
    heap.allocate(HeapData::Class(ClassObj::new(name_id, base)))
}

/// Allocates the class registry and the three root modules. Methods and
/// bindings are attached later by [`install`], once a full `Vm` exists.
pub(crate) fn bootstrap(
    heap: &mut Heap,
) -> (BaseClasses, ExceptionClasses, HeapId, HeapId, HeapId) {
    let object = new_class(heap, "object", None);
    let class = |heap: &mut Heap, name: &str| new_class(heap, name, Some(object));

    let module = class(heap, "module");
    let base = BaseClasses {
        object,
        module,
        type_: class(heap, "type"),
        int: class(heap, "int"),
        float: class(heap, "float"),
        bool_: class(heap, "bool"),
        none_type: class(heap, "NoneType"),
        str_: class(heap, "str"),
        function: class(heap, "function"),
        method: class(heap, "method"),
        tuple: class(heap, "tuple"),
        bytes: class(heap, "bytes"),
        list: class(heap, "list"),
        dict: class(heap, "dict"),
        set: class(heap, "set"),
        generator: class(heap, "generator"),
        property: class(heap, "property"),
        range: class(heap, "range"),
        list_iterator: class(heap, "listiterator"),
        tuple_iterator: class(heap, "tupleiterator"),
        str_iterator: class(heap, "striterator"),
        range_iterator: class(heap, "rangeiterator"),
        dict_iterator: class(heap, "dictiterator"),
        set_iterator: class(heap, "setiterator"),
    };
    let exceptions = crate::exceptions::create_classes(heap, object);

    let builtins = heap.allocate(HeapData::Instance(InstanceObj::new(module)));
    let system = heap.allocate(HeapData::Instance(InstanceObj::new(module)));
    let main = heap.allocate(HeapData::Instance(InstanceObj::new(module)));
    (base, exceptions, builtins, system, main)
}

/// Attaches native methods to every builtin class, fills the builtin module
/// namespace, and finalizes the protocol caches.
pub(crate) fn install(vm: &mut Vm) {
    let b = vm.base;

    // No `__str__` on object: `str(x)` falls through to `__repr__` for
    // classes that only define the latter.
    vm.define_native(b.object, ".__repr__", obj_repr);
    vm.define_native(b.object, ".__hash__", obj_hash);

    vm.define_native(b.int, ".__init__", int_init);
    vm.define_native(b.int, ".__repr__", int_repr);
    vm.define_native(b.float, ".__init__", float_init);
    vm.define_native(b.float, ".__repr__", float_repr);
    vm.define_native(b.bool_, ".__init__", bool_init);
    vm.define_native(b.bool_, ".__repr__", bool_repr);
    vm.define_native(b.none_type, ".__repr__", none_repr);

    vm.define_native(b.str_, ".__init__", str_init);
    vm.define_native(b.str_, ".__repr__", str_repr);
    vm.define_native(b.str_, ".__str__", str_str);
    vm.define_native(b.str_, ".__len__", str_len);
    vm.define_native(b.str_, ".__getitem__", str_getitem);
    vm.define_native(b.str_, ".__getslice__", str_getslice);
    vm.define_native(b.str_, ".__contains__", str_contains);
    vm.define_native(b.str_, ".__iter__", str_iter);
    vm.define_native(b.str_, ".join", str_join);
    vm.define_native(b.str_, ".split", str_split);
    vm.define_native(b.str_, ".strip", str_strip);
    vm.define_native(b.str_, ".upper", str_upper);
    vm.define_native(b.str_, ".lower", str_lower);
    vm.define_native(b.str_, ".replace", str_replace);
    vm.define_native(b.str_, ".startswith", str_startswith);
    vm.define_native(b.str_, ".endswith", str_endswith);

    vm.define_native(b.bytes, ".__repr__", bytes_repr);
    vm.define_native(b.bytes, ".__len__", bytes_len);
    vm.define_native(b.bytes, ".__getitem__", bytes_getitem);

    vm.define_native(b.tuple, ".__init__", tuple_init);
    vm.define_native(b.tuple, ".__repr__", tuple_repr);
    vm.define_native(b.tuple, ".__len__", tuple_len);
    vm.define_native(b.tuple, ".__getitem__", tuple_getitem);
    vm.define_native(b.tuple, ".__contains__", tuple_contains);
    vm.define_native(b.tuple, ".__iter__", tuple_iter);

    vm.define_native(b.list, ".__init__", list_init);
    vm.define_native(b.list, ".__repr__", list_repr);
    vm.define_native(b.list, ".__str__", list_repr);
    vm.define_native(b.list, ".__len__", list_len);
    vm.define_native(b.list, ".__getitem__", list_getitem);
    vm.define_native(b.list, ".__setitem__", list_setitem);
    vm.define_native(b.list, ".__delitem__", list_delitem);
    vm.define_native(b.list, ".__getslice__", list_getslice);
    vm.define_native(b.list, ".__setslice__", list_setslice);
    vm.define_native(b.list, ".__contains__", list_contains);
    vm.define_native(b.list, ".__iter__", list_iter);
    vm.define_native(b.list, ".append", list_append);
    vm.define_native(b.list, ".extend", list_extend);
    vm.define_native(b.list, ".insert", list_insert);
    vm.define_native(b.list, ".pop", list_pop);
    vm.define_native(b.list, ".remove", list_remove);
    vm.define_native(b.list, ".clear", list_clear);
    vm.define_native(b.list, ".index", list_index);
    vm.define_native(b.list, ".count", list_count);
    vm.define_native(b.list, ".reverse", list_reverse);
    vm.define_native(b.list, ".sort", list_sort);
    vm.define_native(b.list, ".copy", list_copy);

    vm.define_native(b.dict, ".__init__", dict_init);
    vm.define_native(b.dict, ".__repr__", dict_repr);
    vm.define_native(b.dict, ".__str__", dict_repr);
    vm.define_native(b.dict, ".__len__", dict_len);
    vm.define_native(b.dict, ".__getitem__", dict_getitem);
    vm.define_native(b.dict, ".__setitem__", dict_setitem);
    vm.define_native(b.dict, ".__delitem__", dict_delitem);
    vm.define_native(b.dict, ".__contains__", dict_contains);
    vm.define_native(b.dict, ".__iter__", dict_iter);
    vm.define_native(b.dict, ".get", dict_get);
    vm.define_native(b.dict, ".keys", dict_keys);
    vm.define_native(b.dict, ".values", dict_values);
    vm.define_native(b.dict, ".items", dict_items);
    vm.define_native(b.dict, ".pop", dict_pop);
    vm.define_native(b.dict, ".clear", dict_clear);
    vm.define_native(b.dict, ".copy", dict_copy);
    vm.define_native(b.dict, ".update", dict_update);

    vm.define_native(b.set, ".__init__", set_init);
    vm.define_native(b.set, ".__repr__", set_repr);
    vm.define_native(b.set, ".__str__", set_repr);
    vm.define_native(b.set, ".__len__", set_len);
    vm.define_native(b.set, ".__contains__", set_contains);
    vm.define_native(b.set, ".__iter__", set_iter);
    vm.define_native(b.set, ".__and__", set_and);
    vm.define_native(b.set, ".__or__", set_or);
    vm.define_native(b.set, ".__sub__", set_sub);
    vm.define_native(b.set, ".__xor__", set_xor);
    vm.define_native(b.set, ".add", set_add);
    vm.define_native(b.set, ".remove", set_remove);
    vm.define_native(b.set, ".discard", set_discard);
    vm.define_native(b.set, ".update", set_update);
    vm.define_native(b.set, ".copy", set_copy);

    vm.define_native(b.range, ".__init__", range_init);
    vm.define_native(b.range, ".__repr__", range_repr);
    vm.define_native(b.range, ".__len__", range_len);
    vm.define_native(b.range, ".__contains__", range_contains);
    vm.define_native(b.range, ".__iter__", range_iter);

    for iterator in [
        b.list_iterator,
        b.tuple_iterator,
        b.dict_iterator,
        b.set_iterator,
    ] {
        vm.define_native(iterator, ".__call__", listiter_call);
        vm.define_native(iterator, ".__iter__", iter_self);
    }
    vm.define_native(b.str_iterator, ".__call__", striter_call);
    vm.define_native(b.str_iterator, ".__iter__", iter_self);
    vm.define_native(b.range_iterator, ".__call__", rangeiter_call);
    vm.define_native(b.range_iterator, ".__iter__", iter_self);

    vm.define_native(b.function, ".__repr__", function_repr);
    vm.define_native(b.method, ".__repr__", function_repr);
    vm.define_native(b.property, ".__repr__", property_repr);
    vm.define_native(b.type_, ".__init__", type_init);
    vm.define_native(b.type_, ".__repr__", class_repr);
    vm.define_native(b.type_, ".__str__", class_repr);
    vm.define_native(b.module, ".__repr__", module_repr);
    vm.define_native(b.module, ".__str__", module_repr);

    vm.define_native(b.generator, ".__call__", gen_call);
    vm.define_native(b.generator, ".__iter__", iter_self);
    vm.define_native(b.generator, ".__repr__", gen_repr);
    vm.define_native(b.generator, ".__finish__", gen_finish);
    vm.define_native(b.generator, ".send", gen_send);
    vm.define_native(b.generator, ":gi_running", gen_running);

    for class in b.ids() {
        vm.finalize_class(class);
    }

    // The builtin namespace: classes by name, then functions.
    let builtins = vm.builtins;
    let name_value = vm.copy_string("__builtins__");
    vm.set_field(builtins, "__name__", name_value);
    for (name, class) in [
        ("object", b.object),
        ("type", b.type_),
        ("int", b.int),
        ("float", b.float),
        ("bool", b.bool_),
        ("str", b.str_),
        ("tuple", b.tuple),
        ("bytes", b.bytes),
        ("list", b.list),
        ("dict", b.dict),
        ("set", b.set),
        ("range", b.range),
        ("property", b.property),
    ] {
        vm.set_field(builtins, name, Value::Ref(class));
    }
    let not_implemented = vm.not_implemented_value();
    vm.set_field(builtins, "NotImplemented", not_implemented);

    for (name, function) in [
        ("print", builtin_print as crate::objects::NativeFn),
        ("len", builtin_len),
        ("repr", builtin_repr),
        ("hash", builtin_hash),
        ("id", builtin_id),
        ("isinstance", builtin_isinstance),
        ("dir", builtin_dir),
        ("getattr", builtin_getattr),
        ("ord", builtin_ord),
        ("chr", builtin_chr),
        ("hex", builtin_hex),
        ("any", builtin_any),
        ("all", builtin_all),
        ("next", builtin_next),
        ("listOf", list_of),
        ("dictOf", dict_of),
        ("setOf", set_of),
        ("tupleOf", tuple_of),
    ] {
        vm.define_module_native(builtins, name, function);
    }

    // The `kuroko` system module.
    let system = vm.system;
    let name_value = vm.copy_string("kuroko");
    vm.set_field(system, "__name__", name_value);
    let version = vm.copy_string(env!("CARGO_PKG_VERSION"));
    vm.set_field(system, "version", version);
    let default_path = vm.copy_string("./");
    let module_paths = vm.new_list(vec![default_path]);
    vm.set_field(system, "module_paths", module_paths);

    // The main module needs a name for tracebacks.
    let main = vm.thread.module;
    let name_value = vm.copy_string("__main__");
    vm.set_field(main, "__name__", name_value);

    crate::exceptions::install(vm);
}

// ---------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------

fn type_error(vm: &mut Vm, message: impl Into<String>) -> crate::vm::Raised {
    vm.runtime_error(vm.exceptions.type_error, message)
}

fn first_arg(vm: &mut Vm, args: &[Value], name: &str) -> VmResult<Value> {
    match args.first() {
        Some(&v) => Ok(v),
        None => Err(vm.runtime_error(
            vm.exceptions.argument_error,
            format!("{name}() takes at least 1 argument (0 given)"),
        )),
    }
}

fn expect_args(vm: &mut Vm, args: &[Value], n: usize, name: &str) -> VmResult<()> {
    // `args[0]` is the receiver.
    if args.len() != n + 1 {
        let given = args.len().saturating_sub(1);
        return Err(vm.runtime_error(
            vm.exceptions.argument_error,
            format!("{name}() takes exactly {n} argument(s) ({given} given)"),
        ));
    }
    Ok(())
}

fn expect_str(vm: &mut Vm, v: Value, context: &str) -> VmResult<String> {
    if let Some(id) = v.as_ref_id() {
        if let HeapData::Str(s) = vm.heap.get(id) {
            return Ok(s.as_str().to_string());
        }
    }
    let found = vm.type_name(v).to_string();
    Err(type_error(vm, format!("{context} must be a str, not '{found}'")))
}

fn expect_int(vm: &mut Vm, v: Value, context: &str) -> VmResult<i64> {
    match v.as_int() {
        Some(i) => Ok(i),
        None => {
            let found = vm.type_name(v).to_string();
            Err(type_error(vm, format!("{context} must be an int, not '{found}'")))
        }
    }
}

/// Normalizes a (possibly negative) index against a length.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

/// Clamped `[start:end]` bounds; `None` means the respective edge.
fn slice_bounds(start: Value, end: Value, len: usize) -> (usize, usize) {
    let len_i = len as i64;
    let clamp = |v: i64| -> usize {
        let v = if v < 0 { v + len_i } else { v };
        v.clamp(0, len_i) as usize
    };
    let lo = match start.as_int() {
        Some(i) => clamp(i),
        None => 0,
    };
    let hi = match end.as_int() {
        Some(i) => clamp(i),
        None => len,
    };
    (lo, hi.max(lo))
}

/// Creates an iterator instance with `l` (the source) and `i` (the cursor).
fn make_iterator(vm: &mut Vm, class: HeapId, over: Value) -> Value {
    let instance = vm.new_instance(class);
    let id = instance.as_ref_id().expect("just allocated");
    vm.set_field(id, "l", over);
    vm.set_field(id, "i", Value::Int(0));
    instance
}

fn instance_of(vm: &mut Vm, v: Value, context: &str) -> VmResult<HeapId> {
    match v.as_ref_id() {
        Some(id) => Ok(id),
        None => Err(type_error(vm, format!("{context}: invalid receiver"))),
    }
}

// ---------------------------------------------------------------------
// object / numbers
// ---------------------------------------------------------------------

fn obj_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let rendered = match args[0] {
        Value::None => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format_float(f),
        other => format!("<{} object>", vm.type_name(other)),
    };
    Ok(vm.take_string(rendered))
}

fn obj_hash(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    Ok(Value::Int(i64::from(vm.heap.hash_value(args[0]))))
}

fn int_init(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let Some(&arg) = args.get(1) else {
        return Ok(Value::Int(0));
    };
    match arg {
        Value::Int(_) | Value::Bool(_) => Ok(Value::Int(arg.as_int().expect("checked"))),
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        Value::Ref(id) => {
            let parsed = match vm.heap.get(id) {
                HeapData::Str(s) => s.as_str().trim().parse::<i64>().ok(),
                _ => None,
            };
            match parsed {
                Some(i) => Ok(Value::Int(i)),
                None => {
                    let repr = vm.repr_value(arg)?;
                    Err(vm.runtime_error(
                        vm.exceptions.value_error,
                        format!("invalid literal for int(): {repr}"),
                    ))
                }
            }
        }
        _ => Err(type_error(vm, "int() argument must be a number or string")),
    }
}

fn int_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let i = args[0].as_int().unwrap_or(0);
    Ok(vm.take_string(i.to_string()))
}

fn float_init(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let Some(&arg) = args.get(1) else {
        return Ok(Value::Float(0.0));
    };
    match arg {
        _ if arg.as_float().is_some() => Ok(Value::Float(arg.as_float().expect("checked"))),
        Value::Ref(id) => {
            let parsed = match vm.heap.get(id) {
                HeapData::Str(s) => s.as_str().trim().parse::<f64>().ok(),
                _ => None,
            };
            match parsed {
                Some(f) => Ok(Value::Float(f)),
                None => Err(vm.runtime_error(
                    vm.exceptions.value_error,
                    "could not convert string to float",
                )),
            }
        }
        _ => Err(type_error(vm, "float() argument must be a number or string")),
    }
}

fn float_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let f = args[0].as_float().unwrap_or(0.0);
    Ok(vm.take_string(format_float(f)))
}

fn bool_init(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let arg = args.get(1).copied().unwrap_or(Value::Bool(false));
    Ok(Value::Bool(!vm.is_falsey(arg)))
}

fn bool_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let text = if matches!(args[0], Value::Bool(true)) {
        "True"
    } else {
        "False"
    };
    Ok(vm.copy_string(text))
}

fn none_repr(vm: &mut Vm, _args: &[Value], _kw: bool) -> VmResult<Value> {
    Ok(vm.copy_string("None"))
}

// ---------------------------------------------------------------------
// str
// ---------------------------------------------------------------------

fn str_content(vm: &mut Vm, v: Value) -> VmResult<String> {
    expect_str(vm, v, "string receiver")
}

fn str_init(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let Some(&arg) = args.get(1) else {
        return Ok(vm.copy_string(""));
    };
    // Strings are immutable (and interned); pass them straight through.
    if let Some(id) = arg.as_ref_id() {
        if matches!(vm.heap.get(id), HeapData::Str(_)) {
            return Ok(arg);
        }
    }
    let rendered = vm.str_value(arg)?;
    Ok(vm.take_string(rendered))
}

fn str_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let content = str_content(vm, args[0])?;
    Ok(vm.take_string(crate::objects::string_repr(&content)))
}

fn str_str(_vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    Ok(args[0])
}

fn str_len(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = instance_of(vm, args[0], "__len__")?;
    let len = match vm.heap.get_mut(id) {
        HeapData::Str(s) => s.codepoint_len(),
        _ => return Err(type_error(vm, "__len__ on non-string")),
    };
    Ok(Value::Int(len as i64))
}

fn str_getitem(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "__getitem__")?;
    let index = expect_int(vm, args[1], "string index")?;
    let id = instance_of(vm, args[0], "__getitem__")?;
    let ch = match vm.heap.get_mut(id) {
        HeapData::Str(s) => {
            let len = s.codepoint_len();
            normalize_index(index, len).and_then(|i| s.codepoint_at(i))
        }
        _ => None,
    };
    match ch {
        Some(c) => Ok(vm.take_string(c.to_string())),
        None => Err(vm.runtime_error(vm.exceptions.index_error, "string index out of range")),
    }
}

fn str_getslice(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let content = str_content(vm, args[0])?;
    let chars: Vec<char> = content.chars().collect();
    let (lo, hi) = slice_bounds(args[1], args[2], chars.len());
    let sliced: String = chars[lo..hi].iter().collect();
    Ok(vm.take_string(sliced))
}

fn str_contains(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let haystack = str_content(vm, args[0])?;
    let needle = expect_str(vm, args[1], "__contains__ argument")?;
    Ok(Value::Bool(haystack.contains(&needle)))
}

fn str_iter(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let class = vm.base.str_iterator;
    Ok(make_iterator(vm, class, args[0]))
}

fn str_join(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "join")?;
    let separator = str_content(vm, args[0])?;
    let mut items = Vec::new();
    vm.unpack_iterable_into(args[1], &mut items)?;
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(expect_str(vm, item, "join element")?);
    }
    Ok(vm.take_string(parts.join(&separator)))
}

fn str_split(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let content = str_content(vm, args[0])?;
    let parts: Vec<String> = match args.get(1) {
        Some(&sep) => {
            let sep = expect_str(vm, sep, "separator")?;
            content.split(&sep).map(str::to_string).collect()
        }
        None => content.split_whitespace().map(str::to_string).collect(),
    };
    let values: Vec<Value> = parts
        .into_iter()
        .map(|p| vm.take_string(p))
        .collect();
    Ok(vm.new_list(values))
}

fn str_strip(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let content = str_content(vm, args[0])?;
    Ok(vm.take_string(content.trim().to_string()))
}

fn str_upper(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let content = str_content(vm, args[0])?;
    Ok(vm.take_string(content.to_uppercase()))
}

fn str_lower(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let content = str_content(vm, args[0])?;
    Ok(vm.take_string(content.to_lowercase()))
}

fn str_replace(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 2, "replace")?;
    let content = str_content(vm, args[0])?;
    let from = expect_str(vm, args[1], "replace pattern")?;
    let to = expect_str(vm, args[2], "replace value")?;
    Ok(vm.take_string(content.replace(&from, &to)))
}

fn str_startswith(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "startswith")?;
    let content = str_content(vm, args[0])?;
    let prefix = expect_str(vm, args[1], "prefix")?;
    Ok(Value::Bool(content.starts_with(&prefix)))
}

fn str_endswith(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "endswith")?;
    let content = str_content(vm, args[0])?;
    let suffix = expect_str(vm, args[1], "suffix")?;
    Ok(Value::Bool(content.ends_with(&suffix)))
}

// ---------------------------------------------------------------------
// bytes
// ---------------------------------------------------------------------

fn bytes_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = instance_of(vm, args[0], "__repr__")?;
    let rendered = match vm.heap.get(id) {
        HeapData::Bytes(b) => {
            let mut out = String::from("b'");
            for &byte in b.bytes.iter() {
                match byte {
                    b'\\' => out.push_str("\\\\"),
                    b'\'' => out.push_str("\\'"),
                    b'\n' => out.push_str("\\n"),
                    b'\r' => out.push_str("\\r"),
                    b'\t' => out.push_str("\\t"),
                    0x20..=0x7e => out.push(byte as char),
                    _ => out.push_str(&format!("\\x{byte:02x}")),
                }
            }
            out.push('\'');
            out
        }
        _ => return Err(type_error(vm, "__repr__ on non-bytes")),
    };
    Ok(vm.take_string(rendered))
}

fn bytes_len(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = instance_of(vm, args[0], "__len__")?;
    match vm.heap.get(id) {
        HeapData::Bytes(b) => Ok(Value::Int(b.bytes.len() as i64)),
        _ => Err(type_error(vm, "__len__ on non-bytes")),
    }
}

fn bytes_getitem(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "__getitem__")?;
    let index = expect_int(vm, args[1], "bytes index")?;
    let id = instance_of(vm, args[0], "__getitem__")?;
    let byte = match vm.heap.get(id) {
        HeapData::Bytes(b) => normalize_index(index, b.bytes.len()).map(|i| b.bytes[i]),
        _ => None,
    };
    match byte {
        Some(b) => Ok(Value::Int(i64::from(b))),
        None => Err(vm.runtime_error(vm.exceptions.index_error, "index out of range")),
    }
}

// ---------------------------------------------------------------------
// tuple
// ---------------------------------------------------------------------

fn tuple_items(vm: &mut Vm, v: Value, context: &str) -> VmResult<Vec<Value>> {
    let id = instance_of(vm, v, context)?;
    match vm.heap.get(id) {
        HeapData::Tuple(t) => Ok(t.items.to_vec()),
        _ => Err(type_error(vm, format!("{context} on non-tuple"))),
    }
}

fn tuple_init(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let mut items = Vec::new();
    if let Some(&arg) = args.get(1) {
        vm.unpack_iterable_into(arg, &mut items)?;
    }
    Ok(vm.new_tuple(items))
}

fn tuple_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = instance_of(vm, args[0], "__repr__")?;
    if vm.heap.entry(id).in_repr {
        return Ok(vm.copy_string("(...)"));
    }
    vm.heap.entry_mut(id).in_repr = true;
    let result = (|| {
        let items = tuple_items(vm, args[0], "__repr__")?;
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            parts.push(vm.repr_value(item)?);
        }
        let body = parts.join(", ");
        let rendered = if parts.len() == 1 {
            format!("({body},)")
        } else {
            format!("({body})")
        };
        Ok(vm.take_string(rendered))
    })();
    vm.heap.entry_mut(id).in_repr = false;
    result
}

fn tuple_len(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let items = tuple_items(vm, args[0], "__len__")?;
    Ok(Value::Int(items.len() as i64))
}

fn tuple_getitem(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "__getitem__")?;
    let index = expect_int(vm, args[1], "tuple index")?;
    let items = tuple_items(vm, args[0], "__getitem__")?;
    match normalize_index(index, items.len()) {
        Some(i) => Ok(items[i]),
        None => Err(vm.runtime_error(vm.exceptions.index_error, "tuple index out of range")),
    }
}

fn tuple_contains(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let items = tuple_items(vm, args[0], "__contains__")?;
    for item in items {
        if vm.values_equal_dispatch(item, args[1])? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn tuple_iter(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let class = vm.base.tuple_iterator;
    Ok(make_iterator(vm, class, args[0]))
}

// ---------------------------------------------------------------------
// list
// ---------------------------------------------------------------------

fn list_ref(vm: &mut Vm, v: Value, context: &str) -> VmResult<HeapId> {
    let id = instance_of(vm, v, context)?;
    match vm.heap.get(id) {
        HeapData::List(_) => Ok(id),
        _ => Err(type_error(vm, format!("{context} on non-list"))),
    }
}

fn list_items(vm: &mut Vm, v: Value, context: &str) -> VmResult<Vec<Value>> {
    let id = list_ref(vm, v, context)?;
    match vm.heap.get(id) {
        HeapData::List(l) => Ok(l.items.clone()),
        _ => unreachable!(),
    }
}

fn with_list<R>(vm: &mut Vm, id: HeapId, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
    match vm.heap.get_mut(id) {
        HeapData::List(l) => f(&mut l.items),
        _ => unreachable!("checked by list_ref"),
    }
}

fn list_init(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let mut items = Vec::new();
    if let Some(&arg) = args.get(1) {
        vm.unpack_iterable_into(arg, &mut items)?;
    }
    Ok(vm.new_list(items))
}

fn list_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = list_ref(vm, args[0], "__repr__")?;
    if vm.heap.entry(id).in_repr {
        return Ok(vm.copy_string("[...]"));
    }
    vm.heap.entry_mut(id).in_repr = true;
    let result = (|| {
        let items = list_items(vm, args[0], "__repr__")?;
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            parts.push(vm.repr_value(item)?);
        }
        Ok(vm.take_string(format!("[{}]", parts.join(", "))))
    })();
    vm.heap.entry_mut(id).in_repr = false;
    result
}

fn list_len(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = list_ref(vm, args[0], "__len__")?;
    let len = with_list(vm, id, |items| items.len());
    Ok(Value::Int(len as i64))
}

fn list_getitem(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "__getitem__")?;
    let index = expect_int(vm, args[1], "list index")?;
    let id = list_ref(vm, args[0], "__getitem__")?;
    let item = with_list(vm, id, |items| {
        normalize_index(index, items.len()).map(|i| items[i])
    });
    match item {
        Some(v) => Ok(v),
        None => Err(vm.runtime_error(vm.exceptions.index_error, "list index out of range")),
    }
}

fn list_setitem(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 2, "__setitem__")?;
    let index = expect_int(vm, args[1], "list index")?;
    let id = list_ref(vm, args[0], "__setitem__")?;
    let value = args[2];
    let ok = with_list(vm, id, |items| {
        match normalize_index(index, items.len()) {
            Some(i) => {
                items[i] = value;
                true
            }
            None => false,
        }
    });
    if !ok {
        return Err(vm.runtime_error(vm.exceptions.index_error, "list index out of range"));
    }
    Ok(value)
}

fn list_delitem(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "__delitem__")?;
    let index = expect_int(vm, args[1], "list index")?;
    let id = list_ref(vm, args[0], "__delitem__")?;
    let ok = with_list(vm, id, |items| {
        match normalize_index(index, items.len()) {
            Some(i) => {
                items.remove(i);
                true
            }
            None => false,
        }
    });
    if !ok {
        return Err(vm.runtime_error(vm.exceptions.index_error, "list index out of range"));
    }
    Ok(Value::None)
}

fn list_getslice(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = list_ref(vm, args[0], "__getslice__")?;
    let sliced = with_list(vm, id, |items| {
        let (lo, hi) = slice_bounds(args[1], args[2], items.len());
        items[lo..hi].to_vec()
    });
    Ok(vm.new_list(sliced))
}

fn list_setslice(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = list_ref(vm, args[0], "__setslice__")?;
    let mut replacement = Vec::new();
    vm.unpack_iterable_into(args[3], &mut replacement)?;
    with_list(vm, id, |items| {
        let (lo, hi) = slice_bounds(args[1], args[2], items.len());
        items.splice(lo..hi, replacement);
    });
    Ok(Value::None)
}

fn list_contains(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let items = list_items(vm, args[0], "__contains__")?;
    for item in items {
        if vm.values_equal_dispatch(item, args[1])? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn list_iter(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let class = vm.base.list_iterator;
    Ok(make_iterator(vm, class, args[0]))
}

fn list_append(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "append")?;
    let id = list_ref(vm, args[0], "append")?;
    let value = args[1];
    with_list(vm, id, |items| items.push(value));
    Ok(Value::None)
}

fn list_extend(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "extend")?;
    let id = list_ref(vm, args[0], "extend")?;
    let mut new_items = Vec::new();
    vm.unpack_iterable_into(args[1], &mut new_items)?;
    with_list(vm, id, |items| items.extend(new_items));
    Ok(Value::None)
}

fn list_insert(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 2, "insert")?;
    let index = expect_int(vm, args[1], "insert index")?;
    let id = list_ref(vm, args[0], "insert")?;
    let value = args[2];
    with_list(vm, id, |items| {
        let len = items.len() as i64;
        let at = if index < 0 {
            (index + len).clamp(0, len)
        } else {
            index.min(len)
        } as usize;
        items.insert(at, value);
    });
    Ok(Value::None)
}

fn list_pop(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = list_ref(vm, args[0], "pop")?;
    let index = match args.get(1) {
        Some(&v) => Some(expect_int(vm, v, "pop index")?),
        None => None,
    };
    let popped = with_list(vm, id, |items| {
        let i = match index {
            Some(i) => normalize_index(i, items.len())?,
            None => items.len().checked_sub(1)?,
        };
        Some(items.remove(i))
    });
    match popped {
        Some(v) => Ok(v),
        None => Err(vm.runtime_error(vm.exceptions.index_error, "pop from empty list")),
    }
}

fn list_remove(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "remove")?;
    let items = list_items(vm, args[0], "remove")?;
    for (i, item) in items.iter().enumerate() {
        if vm.values_equal_dispatch(*item, args[1])? {
            let id = list_ref(vm, args[0], "remove")?;
            with_list(vm, id, |items| {
                items.remove(i);
            });
            return Ok(Value::None);
        }
    }
    Err(vm.runtime_error(vm.exceptions.value_error, "list.remove(x): x not in list"))
}

fn list_clear(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = list_ref(vm, args[0], "clear")?;
    with_list(vm, id, |items| items.clear());
    Ok(Value::None)
}

fn list_index(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "index")?;
    let items = list_items(vm, args[0], "index")?;
    for (i, item) in items.iter().enumerate() {
        if vm.values_equal_dispatch(*item, args[1])? {
            return Ok(Value::Int(i as i64));
        }
    }
    Err(vm.runtime_error(vm.exceptions.value_error, "x not in list"))
}

fn list_count(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "count")?;
    let items = list_items(vm, args[0], "count")?;
    let mut count = 0i64;
    for item in items {
        if vm.values_equal_dispatch(item, args[1])? {
            count += 1;
        }
    }
    Ok(Value::Int(count))
}

fn list_reverse(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = list_ref(vm, args[0], "reverse")?;
    with_list(vm, id, |items| items.reverse());
    Ok(Value::None)
}

/// In-place sort over ints, floats and strings (no key function).
fn list_sort(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = list_ref(vm, args[0], "sort")?;
    let mut items = with_list(vm, id, std::mem::take);
    let sortable = items.iter().all(|v| {
        v.as_float().is_some()
            || matches!(
                v.as_ref_id().map(|id| vm.heap.get(id)),
                Some(HeapData::Str(_))
            )
    });
    if !sortable {
        with_list(vm, id, |slot| *slot = items);
        return Err(type_error(vm, "sort() requires numbers or strings"));
    }
    items.sort_by(|&a, &b| {
        if let (Some(x), Some(y)) = (a.as_float(), b.as_float()) {
            return x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal);
        }
        let x = a.as_ref_id().map(|id| vm.heap.str_content(id)).unwrap_or("");
        let y = b.as_ref_id().map(|id| vm.heap.str_content(id)).unwrap_or("");
        x.cmp(y)
    });
    with_list(vm, id, |slot| *slot = items);
    Ok(Value::None)
}

fn list_copy(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let items = list_items(vm, args[0], "copy")?;
    Ok(vm.new_list(items))
}

// ---------------------------------------------------------------------
// dict
// ---------------------------------------------------------------------

fn dict_ref(vm: &mut Vm, v: Value, context: &str) -> VmResult<HeapId> {
    let id = instance_of(vm, v, context)?;
    match vm.heap.get(id) {
        HeapData::Dict(_) => Ok(id),
        _ => Err(type_error(vm, format!("{context} on non-dict"))),
    }
}

fn dict_pairs(vm: &Vm, id: HeapId) -> Vec<(Value, Value)> {
    match vm.heap.get(id) {
        HeapData::Dict(d) => d.entries.iter().collect(),
        _ => unreachable!(),
    }
}

fn dict_init(vm: &mut Vm, _args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = vm.heap.allocate(HeapData::Dict(DictObj::default()));
    Ok(Value::Ref(id))
}

fn dict_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "__repr__")?;
    if vm.heap.entry(id).in_repr {
        return Ok(vm.copy_string("{...}"));
    }
    vm.heap.entry_mut(id).in_repr = true;
    let result = (|| {
        let pairs = dict_pairs(vm, id);
        let mut parts = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            let key = vm.repr_value(k)?;
            let value = vm.repr_value(v)?;
            parts.push(format!("{key}: {value}"));
        }
        Ok(vm.take_string(format!("{{{}}}", parts.join(", "))))
    })();
    vm.heap.entry_mut(id).in_repr = false;
    result
}

fn dict_len(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "__len__")?;
    match vm.heap.get(id) {
        HeapData::Dict(d) => Ok(Value::Int(d.entries.len() as i64)),
        _ => unreachable!(),
    }
}

fn dict_getitem(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "__getitem__")?;
    let id = dict_ref(vm, args[0], "__getitem__")?;
    let found = match vm.heap.get(id) {
        HeapData::Dict(d) => d.entries.get(&vm.heap, args[1]),
        _ => unreachable!(),
    };
    match found {
        Some(v) => Ok(v),
        None => {
            let key = vm.repr_value(args[1])?;
            Err(vm.runtime_error(vm.exceptions.key_error, key))
        }
    }
}

fn dict_setitem(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 2, "__setitem__")?;
    let id = dict_ref(vm, args[0], "__setitem__")?;
    let (key, value) = (args[1], args[2]);
    vm.heap.with_entry(id, |heap, data| {
        if let HeapData::Dict(d) = data {
            d.entries.set(heap, key, value);
        }
    });
    Ok(value)
}

fn dict_delitem(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "__delitem__")?;
    let id = dict_ref(vm, args[0], "__delitem__")?;
    let key = args[1];
    let removed = vm.heap.with_entry(id, |heap, data| match data {
        HeapData::Dict(d) => d.entries.delete(heap, key),
        _ => false,
    });
    if !removed {
        let key = vm.repr_value(args[1])?;
        return Err(vm.runtime_error(vm.exceptions.key_error, key));
    }
    Ok(Value::None)
}

fn dict_contains(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "__contains__")?;
    let found = match vm.heap.get(id) {
        HeapData::Dict(d) => d.entries.get(&vm.heap, args[1]).is_some(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(found))
}

fn dict_iter(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "__iter__")?;
    let keys: Vec<Value> = dict_pairs(vm, id).into_iter().map(|(k, _)| k).collect();
    let keys_list = vm.new_list(keys);
    let class = vm.base.dict_iterator;
    Ok(make_iterator(vm, class, keys_list))
}

fn dict_get(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "get")?;
    let found = match vm.heap.get(id) {
        HeapData::Dict(d) => d.entries.get(&vm.heap, args[1]),
        _ => unreachable!(),
    };
    Ok(found.or(args.get(2).copied()).unwrap_or(Value::None))
}

fn dict_keys(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "keys")?;
    let keys: Vec<Value> = dict_pairs(vm, id).into_iter().map(|(k, _)| k).collect();
    Ok(vm.new_list(keys))
}

fn dict_values(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "values")?;
    let values: Vec<Value> = dict_pairs(vm, id).into_iter().map(|(_, v)| v).collect();
    Ok(vm.new_list(values))
}

fn dict_items(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "items")?;
    let pairs = dict_pairs(vm, id);
    let mut tuples = Vec::with_capacity(pairs.len());
    for (k, v) in pairs {
        tuples.push(vm.new_tuple(vec![k, v]));
    }
    Ok(vm.new_list(tuples))
}

fn dict_pop(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "pop")?;
    let key = args[1];
    let found = match vm.heap.get(id) {
        HeapData::Dict(d) => d.entries.get(&vm.heap, key),
        _ => unreachable!(),
    };
    match found {
        Some(v) => {
            vm.heap.with_entry(id, |heap, data| {
                if let HeapData::Dict(d) = data {
                    d.entries.delete(heap, key);
                }
            });
            Ok(v)
        }
        None => match args.get(2) {
            Some(&default) => Ok(default),
            None => {
                let key = vm.repr_value(key)?;
                Err(vm.runtime_error(vm.exceptions.key_error, key))
            }
        },
    }
}

fn dict_clear(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "clear")?;
    if let HeapData::Dict(d) = vm.heap.get_mut(id) {
        d.entries = crate::table::ValueTable::new();
    }
    Ok(Value::None)
}

fn dict_copy(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = dict_ref(vm, args[0], "copy")?;
    let pairs = dict_pairs(vm, id);
    let mut copy = DictObj::default();
    for (k, v) in pairs {
        copy.entries.set(&vm.heap, k, v);
    }
    Ok(Value::Ref(vm.heap.allocate(HeapData::Dict(copy))))
}

fn dict_update(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "update")?;
    let id = dict_ref(vm, args[0], "update")?;
    let other = dict_ref(vm, args[1], "update")?;
    let pairs = dict_pairs(vm, other);
    vm.heap.with_entry(id, |heap, data| {
        if let HeapData::Dict(d) = data {
            for (k, v) in pairs {
                d.entries.set(heap, k, v);
            }
        }
    });
    Ok(Value::None)
}

// ---------------------------------------------------------------------
// set
// ---------------------------------------------------------------------

fn set_ref(vm: &mut Vm, v: Value, context: &str) -> VmResult<HeapId> {
    let id = instance_of(vm, v, context)?;
    match vm.heap.get(id) {
        HeapData::Set(_) => Ok(id),
        _ => Err(type_error(vm, format!("{context} on non-set"))),
    }
}

fn set_members(vm: &Vm, id: HeapId) -> Vec<Value> {
    match vm.heap.get(id) {
        HeapData::Set(s) => s.entries.iter().map(|(k, _)| k).collect(),
        _ => unreachable!(),
    }
}

fn build_set(vm: &mut Vm, members: impl IntoIterator<Item = Value>) -> Value {
    let mut set = SetObj::default();
    for member in members {
        set.entries.set(&vm.heap, member, Value::Bool(true));
    }
    Value::Ref(vm.heap.allocate(HeapData::Set(set)))
}

fn set_init(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let mut members = Vec::new();
    if let Some(&arg) = args.get(1) {
        vm.unpack_iterable_into(arg, &mut members)?;
    }
    Ok(build_set(vm, members))
}

fn set_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = set_ref(vm, args[0], "__repr__")?;
    let members = set_members(vm, id);
    if members.is_empty() {
        return Ok(vm.copy_string("set()"));
    }
    if vm.heap.entry(id).in_repr {
        return Ok(vm.copy_string("{...}"));
    }
    vm.heap.entry_mut(id).in_repr = true;
    let result = (|| {
        let mut parts = Vec::with_capacity(members.len());
        for member in members {
            parts.push(vm.repr_value(member)?);
        }
        Ok(vm.take_string(format!("{{{}}}", parts.join(", "))))
    })();
    vm.heap.entry_mut(id).in_repr = false;
    result
}

fn set_len(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = set_ref(vm, args[0], "__len__")?;
    match vm.heap.get(id) {
        HeapData::Set(s) => Ok(Value::Int(s.entries.len() as i64)),
        _ => unreachable!(),
    }
}

fn set_contains(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = set_ref(vm, args[0], "__contains__")?;
    let found = match vm.heap.get(id) {
        HeapData::Set(s) => s.entries.get(&vm.heap, args[1]).is_some(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(found))
}

fn set_iter(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = set_ref(vm, args[0], "__iter__")?;
    let members = set_members(vm, id);
    let members_list = vm.new_list(members);
    let class = vm.base.set_iterator;
    Ok(make_iterator(vm, class, members_list))
}

/// Binary set operators; non-set operands defer via the sentinel.
fn set_binary(
    vm: &mut Vm,
    args: &[Value],
    keep: impl Fn(bool, bool) -> bool,
) -> VmResult<Value> {
    let id = set_ref(vm, args[0], "set operator")?;
    let Some(other) = args.get(1).and_then(|v| v.as_ref_id()) else {
        return Ok(vm.not_implemented_value());
    };
    if !matches!(vm.heap.get(other), HeapData::Set(_)) {
        return Ok(vm.not_implemented_value());
    }
    let mine = set_members(vm, id);
    let theirs = set_members(vm, other);
    let mut result = Vec::new();
    for member in &mine {
        let in_other = match vm.heap.get(other) {
            HeapData::Set(s) => s.entries.get(&vm.heap, *member).is_some(),
            _ => unreachable!(),
        };
        if keep(true, in_other) {
            result.push(*member);
        }
    }
    for member in &theirs {
        let in_mine = match vm.heap.get(id) {
            HeapData::Set(s) => s.entries.get(&vm.heap, *member).is_some(),
            _ => unreachable!(),
        };
        if !in_mine && keep(false, true) {
            result.push(*member);
        }
    }
    Ok(build_set(vm, result))
}

fn set_and(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    set_binary(vm, args, |in_mine, in_other| in_mine && in_other)
}

fn set_or(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    set_binary(vm, args, |_, _| true)
}

fn set_sub(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    set_binary(vm, args, |in_mine, in_other| in_mine && !in_other)
}

fn set_xor(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    set_binary(vm, args, |in_mine, in_other| !(in_mine && in_other))
}

fn set_add(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "add")?;
    let id = set_ref(vm, args[0], "add")?;
    let member = args[1];
    vm.heap.with_entry(id, |heap, data| {
        if let HeapData::Set(s) = data {
            s.entries.set(heap, member, Value::Bool(true));
        }
    });
    Ok(Value::None)
}

fn set_remove(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "remove")?;
    let id = set_ref(vm, args[0], "remove")?;
    let member = args[1];
    let removed = vm.heap.with_entry(id, |heap, data| match data {
        HeapData::Set(s) => s.entries.delete(heap, member),
        _ => false,
    });
    if !removed {
        let key = vm.repr_value(member)?;
        return Err(vm.runtime_error(vm.exceptions.key_error, key));
    }
    Ok(Value::None)
}

fn set_discard(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "discard")?;
    let id = set_ref(vm, args[0], "discard")?;
    let member = args[1];
    vm.heap.with_entry(id, |heap, data| {
        if let HeapData::Set(s) = data {
            s.entries.delete(heap, member);
        }
    });
    Ok(Value::None)
}

fn set_update(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "update")?;
    let id = set_ref(vm, args[0], "update")?;
    let mut members = Vec::new();
    vm.unpack_iterable_into(args[1], &mut members)?;
    vm.heap.with_entry(id, |heap, data| {
        if let HeapData::Set(s) = data {
            for member in members {
                s.entries.set(heap, member, Value::Bool(true));
            }
        }
    });
    Ok(Value::None)
}

fn set_copy(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = set_ref(vm, args[0], "copy")?;
    let members = set_members(vm, id);
    Ok(build_set(vm, members))
}

// ---------------------------------------------------------------------
// range
// ---------------------------------------------------------------------

fn range_parts(vm: &mut Vm, v: Value) -> VmResult<(i64, i64, i64)> {
    let id = instance_of(vm, v, "range")?;
    let get = |vm: &Vm, name: &str| {
        vm.get_field(id, name).and_then(|v| v.as_int())
    };
    match (get(vm, "start"), get(vm, "stop"), get(vm, "step")) {
        (Some(start), Some(stop), Some(step)) => Ok((start, stop, step)),
        _ => Err(type_error(vm, "malformed range object")),
    }
}

fn range_init(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let (start, stop, step) = match args.len() {
        2 => (0, expect_int(vm, args[1], "range stop")?, 1),
        3 => (
            expect_int(vm, args[1], "range start")?,
            expect_int(vm, args[2], "range stop")?,
            1,
        ),
        4 => (
            expect_int(vm, args[1], "range start")?,
            expect_int(vm, args[2], "range stop")?,
            expect_int(vm, args[3], "range step")?,
        ),
        _ => {
            return Err(vm.runtime_error(
                vm.exceptions.argument_error,
                "range expected 1 to 3 arguments",
            ))
        }
    };
    if step == 0 {
        return Err(vm.runtime_error(vm.exceptions.value_error, "range() arg 3 must not be zero"));
    }
    let id = instance_of(vm, args[0], "range")?;
    vm.set_field(id, "start", Value::Int(start));
    vm.set_field(id, "stop", Value::Int(stop));
    vm.set_field(id, "step", Value::Int(step));
    Ok(args[0])
}

fn range_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let (start, stop, step) = range_parts(vm, args[0])?;
    let rendered = if step == 1 {
        format!("range({start}, {stop})")
    } else {
        format!("range({start}, {stop}, {step})")
    };
    Ok(vm.take_string(rendered))
}

fn range_length(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 {
        ((stop - start).max(0) + step - 1) / step
    } else {
        ((start - stop).max(0) + (-step) - 1) / (-step)
    }
}

fn range_len(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let (start, stop, step) = range_parts(vm, args[0])?;
    Ok(Value::Int(range_length(start, stop, step)))
}

fn range_contains(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let (start, stop, step) = range_parts(vm, args[0])?;
    let Some(v) = args.get(1).and_then(|v| v.as_int()) else {
        return Ok(Value::Bool(false));
    };
    let inside = if step > 0 {
        v >= start && v < stop && (v - start) % step == 0
    } else {
        v <= start && v > stop && (start - v) % (-step) == 0
    };
    Ok(Value::Bool(inside))
}

fn range_iter(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let (start, stop, step) = range_parts(vm, args[0])?;
    let class = vm.base.range_iterator;
    let instance = vm.new_instance(class);
    let id = instance.as_ref_id().expect("just allocated");
    vm.set_field(id, "i", Value::Int(start));
    vm.set_field(id, "end", Value::Int(stop));
    vm.set_field(id, "step", Value::Int(step));
    Ok(instance)
}

// ---------------------------------------------------------------------
// Iterators
// ---------------------------------------------------------------------

fn iter_self(_vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    Ok(args[0])
}

/// Shared `__call__` for iterators whose `l` field is list-like.
fn listiter_call(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let this = instance_of(vm, args[0], "iterator")?;
    let source = vm.get_field(this, "l").unwrap_or(Value::None);
    let index = vm
        .get_field(this, "i")
        .and_then(|v| v.as_int())
        .unwrap_or(0);
    let item = match source.as_ref_id().map(|id| vm.heap.get(id)) {
        Some(HeapData::List(l)) => l.items.get(index as usize).copied(),
        Some(HeapData::Tuple(t)) => t.items.get(index as usize).copied(),
        _ => None,
    };
    match item {
        Some(item) => {
            vm.set_field(this, "i", Value::Int(index + 1));
            Ok(item)
        }
        None => Ok(args[0]),
    }
}

fn striter_call(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let this = instance_of(vm, args[0], "iterator")?;
    let source = vm.get_field(this, "l").unwrap_or(Value::None);
    let index = vm
        .get_field(this, "i")
        .and_then(|v| v.as_int())
        .unwrap_or(0);
    let ch = match source.as_ref_id() {
        Some(id) => match vm.heap.get_mut(id) {
            HeapData::Str(s) => s.codepoint_at(index as usize),
            _ => None,
        },
        None => None,
    };
    match ch {
        Some(c) => {
            vm.set_field(this, "i", Value::Int(index + 1));
            Ok(vm.take_string(c.to_string()))
        }
        None => Ok(args[0]),
    }
}

fn rangeiter_call(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let this = instance_of(vm, args[0], "iterator")?;
    let i = vm.get_field(this, "i").and_then(|v| v.as_int()).unwrap_or(0);
    let end = vm
        .get_field(this, "end")
        .and_then(|v| v.as_int())
        .unwrap_or(0);
    let step = vm
        .get_field(this, "step")
        .and_then(|v| v.as_int())
        .unwrap_or(1);
    let live = if step > 0 { i < end } else { i > end };
    if live {
        vm.set_field(this, "i", Value::Int(i + step));
        Ok(Value::Int(i))
    } else {
        Ok(args[0])
    }
}

// ---------------------------------------------------------------------
// Functions, classes, modules, generators
// ---------------------------------------------------------------------

fn callable_name(vm: &Vm, v: Value) -> String {
    let Some(id) = v.as_ref_id() else {
        return "<anonymous>".to_string();
    };
    match vm.heap.get(id) {
        HeapData::Native(n) => n.name.to_string(),
        HeapData::Closure(c) => match vm.heap.get(c.function) {
            HeapData::Function(f) => f
                .name
                .map(|n| vm.heap.str_content(n).to_string())
                .unwrap_or_else(|| "<anonymous>".to_string()),
            _ => "<anonymous>".to_string(),
        },
        HeapData::BoundMethod(b) => callable_name(vm, b.method),
        _ => "<anonymous>".to_string(),
    }
}

fn function_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let is_bound = matches!(
        args[0].as_ref_id().map(|id| vm.heap.get(id)),
        Some(HeapData::BoundMethod(_))
    );
    let name = callable_name(vm, args[0]);
    let rendered = if is_bound {
        format!("<bound method {name}>")
    } else {
        format!("<function {name}>")
    };
    Ok(vm.take_string(rendered))
}

fn property_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = instance_of(vm, args[0], "__repr__")?;
    let name = match vm.heap.get(id) {
        HeapData::Property(p) => callable_name(vm, p.method),
        _ => "<unknown>".to_string(),
    };
    Ok(vm.take_string(format!("<property {name}>")))
}

/// `type(x)` returns x's class.
fn type_init(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    match args.get(1) {
        Some(&v) => Ok(Value::Ref(vm.class_of(v))),
        None => Err(type_error(vm, "type() takes exactly 1 argument")),
    }
}

fn class_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = instance_of(vm, args[0], "__repr__")?;
    let rendered = match vm.heap.get(id) {
        HeapData::Class(c) => format!("<class '{}'>", vm.heap.str_content(c.name)),
        _ => return Err(type_error(vm, "__repr__ on non-class")),
    };
    Ok(vm.take_string(rendered))
}

fn module_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = instance_of(vm, args[0], "__repr__")?;
    let name = vm
        .get_field(id, "__name__")
        .and_then(|v| v.as_ref_id())
        .map(|n| vm.heap.str_content(n).to_string())
        .unwrap_or_else(|| "?".to_string());
    Ok(vm.take_string(format!("<module '{name}'>")))
}

fn generator_ref(vm: &mut Vm, v: Value) -> VmResult<HeapId> {
    match v.as_ref_id() {
        Some(id) if matches!(vm.heap.get(id), HeapData::Generator(_)) => Ok(id),
        _ => Err(type_error(vm, "expected a generator")),
    }
}

fn gen_call(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let generator = generator_ref(vm, args[0])?;
    vm.resume_generator(generator, args.get(1).copied())
}

fn gen_send(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    expect_args(vm, args, 1, "send")?;
    let generator = generator_ref(vm, args[0])?;
    let started = match vm.heap.get(generator) {
        HeapData::Generator(g) => g.started,
        _ => unreachable!(),
    };
    if !started && !matches!(args[1], Value::None) {
        return Err(type_error(
            vm,
            "Can not send non-None value to just-started generator",
        ));
    }
    vm.resume_generator(generator, Some(args[1]))
}

fn gen_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let generator = generator_ref(vm, args[0])?;
    let name = match vm.heap.get(generator) {
        HeapData::Generator(g) => callable_name(vm, Value::Ref(g.closure)),
        _ => unreachable!(),
    };
    Ok(vm.take_string(format!("<generator object {name}>")))
}

fn gen_finish(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let generator = generator_ref(vm, args[0])?;
    match vm.heap.get(generator) {
        HeapData::Generator(g) => Ok(g.result),
        _ => unreachable!(),
    }
}

fn gen_running(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let generator = generator_ref(vm, args[0])?;
    match vm.heap.get(generator) {
        HeapData::Generator(g) => Ok(Value::Bool(g.running)),
        _ => unreachable!(),
    }
}

// ---------------------------------------------------------------------
// Global functions
// ---------------------------------------------------------------------

fn builtin_print(vm: &mut Vm, args: &[Value], has_kwargs: bool) -> VmResult<Value> {
    let mut sep = " ".to_string();
    let mut end = "\n".to_string();
    let positional = if has_kwargs {
        let kwargs = args.last().copied().expect("kwargs dict is present");
        if let Some(HeapData::Dict(d)) = kwargs.as_ref_id().map(|id| vm.heap.get(id)) {
            let pairs: Vec<(Value, Value)> = d.entries.iter().collect();
            for (k, v) in pairs {
                let key = k
                    .as_ref_id()
                    .map(|id| vm.heap.str_content(id).to_string())
                    .unwrap_or_default();
                match key.as_str() {
                    "sep" => sep = expect_str(vm, v, "sep")?,
                    "end" => end = expect_str(vm, v, "end")?,
                    other => {
                        return Err(type_error(
                            vm,
                            format!("'{other}' is an invalid keyword argument for print()"),
                        ))
                    }
                }
            }
        }
        &args[..args.len() - 1]
    } else {
        args
    };

    let mut rendered = Vec::with_capacity(positional.len());
    for &value in positional {
        rendered.push(vm.str_value(value)?);
    }
    let line = format!("{}{end}", rendered.join(&sep));
    vm.write_output(&line);
    Ok(Value::None)
}

fn builtin_len(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let v = first_arg(vm, args, "len")?;
    let direct = match v.as_ref_id() {
        Some(id) => match vm.heap.get_mut(id) {
            HeapData::Str(s) => Some(s.codepoint_len()),
            HeapData::Bytes(b) => Some(b.bytes.len()),
            HeapData::Tuple(t) => Some(t.items.len()),
            HeapData::List(l) => Some(l.items.len()),
            HeapData::Dict(d) => Some(d.entries.len()),
            HeapData::Set(s) => Some(s.entries.len()),
            _ => None,
        },
        None => None,
    };
    if let Some(len) = direct {
        return Ok(Value::Int(len as i64));
    }
    match vm.special_of(v, Special::Len) {
        Some(len_fn) => {
            vm.push(v);
            let result = vm.call_simple(len_fn, 1)?;
            match result.as_int() {
                Some(_) => Ok(result),
                None => Err(type_error(vm, "__len__ must return an int")),
            }
        }
        None => {
            let found = vm.type_name(v).to_string();
            Err(type_error(vm, format!("object of type '{found}' has no len()")))
        }
    }
}

fn builtin_repr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let v = first_arg(vm, args, "repr")?;
    let rendered = vm.repr_value(v)?;
    Ok(vm.take_string(rendered))
}

fn builtin_hash(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let v = first_arg(vm, args, "hash")?;
    if let Some(id) = v.as_ref_id() {
        if matches!(
            vm.heap.get(id),
            HeapData::List(_) | HeapData::Dict(_) | HeapData::Set(_)
        ) {
            let found = vm.type_name(v).to_string();
            return Err(type_error(vm, format!("unhashable type: '{found}'")));
        }
        if let Some(hash_fn) = vm
            .special_of(v, Special::Hash)
            .filter(|_| matches!(vm.heap.get(id), HeapData::Instance(_)))
        {
            vm.push(v);
            return vm.call_simple(hash_fn, 1);
        }
    }
    Ok(Value::Int(i64::from(vm.heap.hash_value(v))))
}

fn builtin_id(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let value = match first_arg(vm, args, "id")? {
        Value::Ref(id) => id.index() as i64,
        other => i64::from(vm.heap.hash_value(other)),
    };
    Ok(Value::Int(value))
}

fn builtin_isinstance(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let (Some(&value), Some(&class)) = (args.first(), args.get(1)) else {
        return Err(type_error(vm, "isinstance expected 2 arguments"));
    };
    let classes: Vec<HeapId> = match class.as_ref_id().map(|id| (id, vm.heap.get(id))) {
        Some((id, HeapData::Class(_))) => vec![id],
        Some((_, HeapData::Tuple(t))) => t
            .items
            .iter()
            .filter_map(|v| v.as_ref_id())
            .collect(),
        _ => {
            return Err(type_error(
                vm,
                "isinstance() arg 2 must be a type or tuple of types",
            ))
        }
    };
    let matched = classes.iter().any(|&c| vm.is_instance_of(value, c));
    Ok(Value::Bool(matched))
}

fn builtin_dir(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let v = first_arg(vm, args, "dir")?;
    let mut names: Vec<String> = Vec::new();
    if let Some(id) = v.as_ref_id() {
        if let HeapData::Instance(i) = vm.heap.get(id) {
            for (k, _) in i.fields.iter() {
                if let Some(key) = k.as_ref_id() {
                    names.push(vm.heap.str_content(key).to_string());
                }
            }
        }
    }
    let mut cursor = Some(vm.class_of(v));
    while let Some(class) = cursor {
        let HeapData::Class(c) = vm.heap.get(class) else {
            break;
        };
        for (k, _) in c.methods.iter() {
            if let Some(key) = k.as_ref_id() {
                names.push(vm.heap.str_content(key).to_string());
            }
        }
        cursor = c.base;
    }
    names.sort();
    names.dedup();
    let values: Vec<Value> = names.into_iter().map(|n| vm.copy_string(&n)).collect();
    Ok(vm.new_list(values))
}

fn builtin_getattr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let (Some(&value), Some(&name)) = (args.first(), args.get(1)) else {
        return Err(type_error(vm, "getattr expected at least 2 arguments"));
    };
    let name_text = expect_str(vm, name, "attribute name")?;
    let name_id = vm.heap.intern(&name_text);
    vm.push(value);
    if vm.value_get_property(name_id)? {
        return Ok(vm.pop());
    }
    vm.pop();
    match args.get(2) {
        Some(&default) => Ok(default),
        None => Err(vm.attribute_error(value, name_id)),
    }
}

fn builtin_ord(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let v = first_arg(vm, args, "ord")?;
    let content = expect_str(vm, v, "ord() argument")?;
    let mut chars = content.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(Value::Int(i64::from(c as u32))),
        _ => Err(type_error(
            vm,
            format!("ord() expected a character, but string of length {} found", content.chars().count()),
        )),
    }
}

fn builtin_chr(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let v = first_arg(vm, args, "chr")?;
    let code = expect_int(vm, v, "chr() argument")?;
    let c = u32::try_from(code).ok().and_then(char::from_u32);
    match c {
        Some(c) => Ok(vm.take_string(c.to_string())),
        None => Err(vm.runtime_error(vm.exceptions.value_error, "chr() arg not in range")),
    }
}

fn builtin_hex(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let v = first_arg(vm, args, "hex")?;
    let i = expect_int(vm, v, "hex() argument")?;
    let rendered = if i < 0 {
        format!("-0x{:x}", -(i as i128))
    } else {
        format!("0x{i:x}")
    };
    Ok(vm.take_string(rendered))
}

fn builtin_any(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let v = first_arg(vm, args, "any")?;
    let mut items = Vec::new();
    vm.unpack_iterable_into(v, &mut items)?;
    Ok(Value::Bool(items.iter().any(|&v| !vm.is_falsey(v))))
}

fn builtin_all(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let v = first_arg(vm, args, "all")?;
    let mut items = Vec::new();
    vm.unpack_iterable_into(v, &mut items)?;
    Ok(Value::Bool(items.iter().all(|&v| !vm.is_falsey(v))))
}

/// Advances an iterator; exhaustion surfaces as `StopIteration`, carrying
/// the generator's return value when there is one.
fn builtin_next(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let iterator = first_arg(vm, args, "next")?;
    let result = vm.call_simple(iterator, 0)?;
    if !values_same(result, iterator) {
        return Ok(result);
    }
    let final_value = match iterator.as_ref_id().map(|id| vm.heap.get(id)) {
        Some(HeapData::Generator(g)) => g.result,
        _ => Value::None,
    };
    Err(crate::exceptions::stop_iteration_with_value(vm, final_value))
}

// ---------------------------------------------------------------------
// Collection builders used by compiled code
// ---------------------------------------------------------------------

fn list_of(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    Ok(vm.new_list(args.to_vec()))
}

fn tuple_of(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    let id = vm
        .heap
        .allocate(HeapData::Tuple(TupleObj::new(args.to_vec())));
    Ok(Value::Ref(id))
}

fn set_of(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    Ok(build_set(vm, args.to_vec()))
}

fn dict_of(vm: &mut Vm, args: &[Value], _kw: bool) -> VmResult<Value> {
    if args.len() % 2 != 0 {
        return Err(type_error(vm, "dictOf() expects an even number of arguments"));
    }
    let mut dict = DictObj::default();
    for pair in args.chunks_exact(2) {
        dict.entries.set(&vm.heap, pair[0], pair[1]);
    }
    Ok(Value::Ref(vm.heap.allocate(HeapData::Dict(dict))))
}

