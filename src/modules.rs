//! Module loading.
//!
//! Modules are instances of the `module` class whose field table is their
//! namespace. Imports resolve through the VM's module table first; misses
//! search the path prefixes listed in `kuroko.module_paths` for a matching
//! `.krk` source file, which is compiled and executed with the fresh module
//! installed as its global namespace. Dotted names load each component in
//! turn, binding children into their parents, and the whole chain is cached
//! so cyclic imports see the partially-initialized module instead of
//! recursing forever.

use tracing::debug;

use crate::heap::{HeapData, HeapId};
use crate::objects::{ClosureObj, InstanceObj};
use crate::value::Value;
use crate::vm::{CallStatus, Vm, VmResult};
use crate::KurokoError;

/// Creates and registers an empty module.
pub(crate) fn start_module(vm: &mut Vm, name: &str) -> HeapId {
    let module_class = vm.base.module;
    let module = vm
        .heap
        .allocate(HeapData::Instance(InstanceObj::new(module_class)));
    let name_value = Value::Ref(vm.heap.intern(name));
    vm.set_field(module, "__name__", name_value);
    vm.modules.insert(name.into(), module);
    module
}

/// `Import` instruction: resolve a dotted name and push the leaf module.
pub(crate) fn do_recursive_module_load(vm: &mut Vm, name: HeapId) -> VmResult<()> {
    let dotted = vm.heap.str_content(name).to_string();
    if let Some(&module) = vm.modules.get(dotted.as_str()) {
        vm.push(Value::Ref(module));
        return Ok(());
    }

    let mut loaded: Option<HeapId> = None;
    let mut prefix = String::new();
    for component in dotted.split('.') {
        let parent = loaded;
        if !prefix.is_empty() {
            prefix.push('.');
        }
        prefix.push_str(component);

        let module = match vm.modules.get(prefix.as_str()) {
            Some(&module) => module,
            None => load_module(vm, &prefix)?,
        };
        if let Some(parent) = parent {
            vm.set_field(parent, component, Value::Ref(module));
        }
        loaded = Some(module);
    }

    vm.push(Value::Ref(loaded.expect("dotted name has at least one part")));
    Ok(())
}

/// Finds, compiles and executes one module by its dotted name.
fn load_module(vm: &mut Vm, dotted: &str) -> VmResult<HeapId> {
    let relative = dotted.replace('.', "/");
    let Some((path, source)) = find_source(vm, &relative) else {
        return Err(vm.runtime_error(
            vm.exceptions.import_error,
            format!("No module named '{dotted}'"),
        ));
    };
    debug!(module = dotted, path = %path, "loading module");

    // Register before executing so cyclic imports terminate.
    let module = start_module(vm, dotted);
    let file_value = Value::Ref(vm.heap.intern(&path));
    vm.set_field(module, "__file__", file_value);

    let previous_module = vm.thread.module;
    vm.thread.module = module;
    let compiled = crate::compiler::compile(vm, &source, &path);
    let result = match compiled {
        Err(KurokoError::Compile { message, line, .. }) => Err(vm.runtime_error(
            vm.exceptions.syntax_error,
            format!("{message} ({path}, line {line})"),
        )),
        Err(_) => unreachable!("compile only reports compile errors"),
        Ok(function) => {
            let closure = vm.heap.allocate(HeapData::Closure(ClosureObj {
                function,
                upvalues: Vec::new(),
            }));
            vm.push(Value::Ref(closure));
            (|| {
                let status = vm.call_value(Value::Ref(closure), 0, 1)?;
                match status {
                    CallStatus::Returned => {
                        vm.pop();
                    }
                    CallStatus::FramePushed => {
                        vm.run_next()?;
                    }
                }
                Ok(())
            })()
        }
    };
    vm.thread.module = previous_module;
    match result {
        Ok(()) => Ok(module),
        Err(raised) => {
            // A broken module must not stay cached.
            vm.modules.remove(dotted);
            Err(raised)
        }
    }
}

/// Searches `kuroko.module_paths` for `<prefix><relative>.krk`.
fn find_source(vm: &Vm, relative: &str) -> Option<(String, String)> {
    let paths = module_paths(vm);
    for prefix in paths {
        let candidate = format!("{prefix}{relative}.krk");
        if let Ok(source) = std::fs::read_to_string(&candidate) {
            return Some((candidate, source));
        }
    }
    None
}

fn module_paths(vm: &Vm) -> Vec<String> {
    let Some(paths_value) = vm.get_field(vm.system, "module_paths") else {
        return vec!["./".to_string()];
    };
    let Some(HeapData::List(list)) = paths_value.as_ref_id().map(|id| vm.heap.get(id)) else {
        return vec!["./".to_string()];
    };
    list.items
        .iter()
        .filter_map(|v| {
            v.as_ref_id().and_then(|id| match vm.heap.get(id) {
                HeapData::Str(s) => Some(s.as_str().to_string()),
                _ => None,
            })
        })
        .collect()
}
