//! The exception class hierarchy.
//!
//! Exceptions are ordinary instances: a class from the hierarchy built here,
//! with `arg` holding the message and `file`/`func`/`lineno` filled in by
//! the raise path. `Exception` carries the shared `__init__`, `__repr__`
//! and `__str__`; every concrete exception class just inherits them.

use crate::heap::{Heap, HeapData, HeapId};
use crate::objects::ClassObj;
use crate::value::Value;
use crate::vm::{ExceptionClasses, Vm, VmResult};

/// Allocates the class objects; methods are attached in [`install`].
pub(crate) fn create_classes(heap: &mut Heap, object_class: HeapId) -> ExceptionClasses {
    let mut class = |heap: &mut Heap, name: &str, base: HeapId| {
        let name_id = heap.intern(name);
        heap.allocate(HeapData::Class(ClassObj::new(name_id, Some(base))))
    };

    let base = class(heap, "Exception", object_class);
    ExceptionClasses {
        base,
        syntax_error: class(heap, "SyntaxError", base),
        type_error: class(heap, "TypeError", base),
        value_error: class(heap, "ValueError", base),
        name_error: class(heap, "NameError", base),
        attribute_error: class(heap, "AttributeError", base),
        index_error: class(heap, "IndexError", base),
        key_error: class(heap, "KeyError", base),
        argument_error: class(heap, "ArgumentError", base),
        import_error: class(heap, "ImportError", base),
        not_implemented_error: class(heap, "NotImplementedError", base),
        zero_division_error: class(heap, "ZeroDivisionError", base),
        overflow_error: class(heap, "OverflowError", base),
        stop_iteration: class(heap, "StopIteration", base),
    }
}

/// Binds the shared natives and publishes every class into builtins.
pub(crate) fn install(vm: &mut Vm) {
    let exceptions = vm.exceptions;
    vm.define_native(exceptions.base, ".__init__", exc_init);
    vm.define_native(exceptions.base, ".__repr__", exc_repr);
    vm.define_native(exceptions.base, ".__str__", exc_repr);

    for class in exceptions.ids() {
        vm.finalize_class(class);
        let name = vm.class_name(class);
        let text = vm.heap.str_content(name).to_string();
        let builtins = vm.builtins;
        vm.set_field(builtins, &text, Value::Ref(class));
    }
}

fn exc_init(vm: &mut Vm, args: &[Value], _has_kwargs: bool) -> VmResult<Value> {
    let this = args[0];
    if let Some(instance) = this.as_ref_id() {
        let arg = args.get(1).copied().unwrap_or(Value::None);
        vm.set_field(instance, "arg", arg);
    }
    Ok(this)
}

fn exc_repr(vm: &mut Vm, args: &[Value], _has_kwargs: bool) -> VmResult<Value> {
    let this = args[0];
    let class_name = {
        let class = vm.class_of(this);
        vm.heap.str_content(vm.class_name(class)).to_string()
    };
    let arg = this
        .as_ref_id()
        .and_then(|instance| vm.get_field(instance, "arg"))
        .unwrap_or(Value::None);
    let rendered = match arg {
        Value::None => format!("{class_name}()"),
        Value::Ref(id) => {
            if let HeapData::Str(s) = vm.heap.get(id) {
                let quoted = crate::objects::string_repr(s.as_str());
                format!("{class_name}({quoted})")
            } else {
                let inner = vm.repr_value(arg)?;
                format!("{class_name}({inner})")
            }
        }
        other => {
            let inner = vm.repr_value(other)?;
            format!("{class_name}({inner})")
        }
    };
    Ok(Value::Ref(vm.heap.take_string(rendered)))
}

/// Convenience used by the iteration machinery: a `StopIteration` carrying
/// the generator's return value.
pub(crate) fn stop_iteration_with_value(vm: &mut Vm, value: Value) -> crate::vm::Raised {
    let raised = vm.runtime_error(vm.exceptions.stop_iteration, String::new());
    if let Some(Value::Ref(instance)) = vm.thread.current_exception {
        vm.set_field(instance, "value", value);
        // An empty message reads better as a bare StopIteration.
        let none_key = vm.heap.intern("arg");
        vm.set_field_by_id(instance, none_key, Value::None);
    }
    raised
}
