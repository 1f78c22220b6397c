//! Arena heap and tracing garbage collector.
//!
//! Every heap object lives in an indexed slot arena and is addressed by a
//! [`HeapId`] handle; the object graph holds handles, never references, so
//! cyclic structures (instances pointing at classes, closures at upvalues)
//! need no special treatment. Collection is classic mark-sweep: the VM marks
//! its roots, `trace_references` drains the gray worklist, and `sweep` frees
//! whatever stayed white, returning the slots to a free list.
//!
//! Collection only ever runs at VM safe points (between instructions or an
//! explicit `collect`), never inside allocation, so freshly built objects
//! don't need rooting while they are wired together.
//!
//! The heap also owns the string intern table: equal string content always
//! yields the same handle, and sweeping a string removes its intern entry.

use ahash::AHashMap;
use tracing::debug;

use crate::objects::{
    BoundMethodObj, BytesObj, ClassObj, ClosureObj, DictObj, FunctionObj, GeneratorObj,
    InstanceObj, ListObj, NativeObj, PropertyObj, SetObj, StrObj, TupleObj, UpvalueObj,
};
use crate::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const GC_FIRST_THRESHOLD: usize = 1024 * 1024;

/// Handle to a heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Placeholder handle used while registries are under construction; it
    /// is always overwritten before being dereferenced.
    pub(crate) const fn invalid() -> HeapId {
        HeapId(0)
    }
}

/// Payload of a heap slot.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(StrObj),
    Bytes(BytesObj),
    Tuple(TupleObj),
    List(ListObj),
    Dict(DictObj),
    Set(SetObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Native(NativeObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Property(PropertyObj),
    Generator(GeneratorObj),
    /// Placeholder while an entry is checked out via [`Heap::with_entry`].
    Moved,
}

impl HeapData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapData::Str(_) => "str",
            HeapData::Bytes(_) => "bytes",
            HeapData::Tuple(_) => "tuple",
            HeapData::List(_) => "list",
            HeapData::Dict(_) => "dict",
            HeapData::Set(_) => "set",
            HeapData::Function(_) | HeapData::Closure(_) => "function",
            HeapData::Upvalue(_) => "upvalue",
            HeapData::Native(_) => "builtin_function_or_method",
            HeapData::Class(_) => "type",
            HeapData::Instance(_) => "object",
            HeapData::BoundMethod(_) => "method",
            HeapData::Property(_) => "property",
            HeapData::Generator(_) => "generator",
            HeapData::Moved => "moved",
        }
    }
}

/// Per-object header bits.
#[derive(Debug)]
pub(crate) struct HeapEntry {
    pub marked: bool,
    /// Set while the object is on the repr recursion path.
    pub in_repr: bool,
    /// Never swept; used for the pre-interned special method names.
    pub immortal: bool,
    /// Survived collections; informational only (single-generation sweep).
    pub generation: u8,
    /// Cached content hash for str/bytes/tuple; `None` means identity hash.
    pub hash: Option<u32>,
    pub data: HeapData,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<HeapEntry>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
    strings: AHashMap<Box<str>, HeapId>,
    gray: Vec<HeapId>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            next_gc: GC_FIRST_THRESHOLD,
            ..Self::default()
        }
    }

    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    #[inline]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn allocate(&mut self, data: HeapData) -> HeapId {
        let hash = self.content_hash(&data);
        self.allocate_with_hash(data, hash)
    }

    fn allocate_with_hash(&mut self, data: HeapData, hash: Option<u32>) -> HeapId {
        self.bytes_allocated += estimate_size(&data);
        let entry = HeapEntry {
            marked: false,
            in_repr: false,
            immortal: false,
            generation: 0,
            hash,
            data,
        };
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(entry);
            HeapId(index)
        } else {
            let index = u32::try_from(self.slots.len()).expect("heap exhausted");
            self.slots.push(Some(entry));
            HeapId(index)
        }
    }

    /// Interns a string, returning the canonical handle for its content.
    pub fn intern(&mut self, s: &str) -> HeapId {
        if let Some(&id) = self.strings.get(s) {
            return id;
        }
        let hash = fnv1a(s.as_bytes());
        let id = self.allocate_with_hash(HeapData::Str(StrObj::new(s.to_owned())), Some(hash));
        self.strings.insert(s.into(), id);
        id
    }

    /// Interns an owned string without re-copying when it is new.
    pub fn take_string(&mut self, s: String) -> HeapId {
        if let Some(&id) = self.strings.get(s.as_str()) {
            return id;
        }
        let hash = fnv1a(s.as_bytes());
        let key: Box<str> = s.as_str().into();
        let id = self.allocate_with_hash(HeapData::Str(StrObj::new(s)), Some(hash));
        self.strings.insert(key, id);
        id
    }

    /// Marks an object as uncollectable.
    pub(crate) fn make_immortal(&mut self, id: HeapId) {
        self.entry_mut(id).immortal = true;
    }

    #[inline]
    pub(crate) fn entry(&self, id: HeapId) -> &HeapEntry {
        self.slots[id.index()].as_ref().expect("stale heap handle")
    }

    #[inline]
    pub(crate) fn entry_mut(&mut self, id: HeapId) -> &mut HeapEntry {
        self.slots[id.index()].as_mut().expect("stale heap handle")
    }

    #[inline]
    pub(crate) fn get(&self, id: HeapId) -> &HeapData {
        &self.entry(id).data
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.entry_mut(id).data
    }

    /// Checks an entry's payload out so the caller can mutate it while still
    /// reading the rest of the heap (hashing table keys, comparing elements).
    /// The payload is restored afterwards. No collection can run in between:
    /// collection happens only at safe points, and the VM is mid-instruction.
    pub(crate) fn with_entry<R>(
        &mut self,
        id: HeapId,
        f: impl FnOnce(&mut Heap, &mut HeapData) -> R,
    ) -> R {
        let mut data = std::mem::replace(&mut self.entry_mut(id).data, HeapData::Moved);
        let result = f(self, &mut data);
        self.entry_mut(id).data = data;
        result
    }

    /// The canonical handle for already-interned content, if any.
    pub(crate) fn lookup_interned(&self, s: &str) -> Option<HeapId> {
        self.strings.get(s).copied()
    }

    /// String content access; panics when `id` is not a string.
    pub(crate) fn str_content(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Str(s) => s.as_str(),
            other => panic!("expected str, found {}", other.kind_name()),
        }
    }

    // ------------------------------------------------------------------
    // Structural hashing and equality (never calls managed code)
    // ------------------------------------------------------------------

    /// Structural hash used by the value-keyed tables. Numeric values that
    /// compare equal hash alike (1, 1.0 and True collide on purpose).
    pub(crate) fn hash_value(&self, v: Value) -> u32 {
        match v {
            Value::None => 0x9e37_79b9,
            Value::Bool(b) => u32::from(b),
            Value::Int(i) => hash_i64(i),
            Value::Float(f) => {
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    hash_i64(f as i64)
                } else {
                    hash_i64(f.to_bits() as i64)
                }
            }
            Value::Kwargs(n) => n,
            Value::Handler(h) => h.target,
            Value::Ref(id) => self
                .entry(id)
                .hash
                .unwrap_or_else(|| hash_i64(id.index() as i64)),
        }
    }

    /// Structural equality with numeric cross-promotion. Heap values compare
    /// by identity except for bytes and tuples (content); strings are
    /// interned, so identity covers them. Managed `__eq__` is layered on top
    /// of this by the VM's `Equal` instruction.
    pub(crate) fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Ref(x), Value::Ref(y)) => {
                if x == y {
                    return true;
                }
                match (self.get(x), self.get(y)) {
                    (HeapData::Bytes(p), HeapData::Bytes(q)) => p.bytes == q.bytes,
                    (HeapData::Tuple(p), HeapData::Tuple(q)) => {
                        p.items.len() == q.items.len()
                            && p.items
                                .iter()
                                .zip(q.items.iter())
                                .all(|(&x, &y)| self.values_equal(x, y))
                    }
                    (HeapData::List(p), HeapData::List(q)) => {
                        p.items.len() == q.items.len()
                            && p.items
                                .iter()
                                .zip(q.items.iter())
                                .all(|(&x, &y)| self.values_equal(x, y))
                    }
                    (HeapData::Dict(p), HeapData::Dict(q)) => {
                        p.entries.len() == q.entries.len()
                            && p.entries.iter().all(|(k, v)| {
                                q.entries.get(self, k).is_some_and(|w| self.values_equal(v, w))
                            })
                    }
                    (HeapData::Set(p), HeapData::Set(q)) => {
                        p.entries.len() == q.entries.len()
                            && p.entries
                                .iter()
                                .all(|(k, _)| q.entries.get(self, k).is_some())
                    }
                    _ => false,
                }
            }
            (Value::None, Value::None) => true,
            (Value::Kwargs(x), Value::Kwargs(y)) => x == y,
            (Value::Handler(x), Value::Handler(y)) => x.kind == y.kind,
            _ => match (a, b) {
                (Value::Float(_), _) | (_, Value::Float(_)) => {
                    match (a.as_float(), b.as_float()) {
                        (Some(x), Some(y)) => x == y,
                        _ => false,
                    }
                }
                _ => match (a.as_int(), b.as_int()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                },
            },
        }
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub(crate) fn mark_value(&mut self, v: Value) {
        if let Value::Ref(id) = v {
            self.mark_object(id);
        }
    }

    pub(crate) fn mark_object(&mut self, id: HeapId) {
        let entry = self.entry_mut(id);
        if entry.marked {
            return;
        }
        entry.marked = true;
        self.gray.push(id);
    }

    /// Drains the gray worklist, blackening each object by marking its
    /// children.
    pub(crate) fn trace_references(&mut self) {
        let mut children: Vec<Value> = Vec::with_capacity(64);
        while let Some(id) = self.gray.pop() {
            children.clear();
            for_each_child(self.get(id), &mut |v| children.push(v));
            for &v in &children {
                self.mark_value(v);
            }
        }
    }

    /// Frees unmarked objects and clears mark bits on survivors. Interned
    /// strings that die are removed from the string table.
    pub(crate) fn sweep(&mut self) {
        let before = self.bytes_allocated;
        for index in 0..self.slots.len() {
            let Some(entry) = self.slots[index].as_mut() else {
                continue;
            };
            if entry.marked || entry.immortal {
                entry.marked = false;
                entry.generation = entry.generation.saturating_add(1);
                continue;
            }
            let entry = self.slots[index].take().expect("checked above");
            if let HeapData::Str(s) = &entry.data {
                self.strings.remove(s.as_str());
            }
            self.bytes_allocated = self
                .bytes_allocated
                .saturating_sub(estimate_size(&entry.data));
            self.free.push(index as u32);
        }
        self.next_gc = (self.bytes_allocated * GC_HEAP_GROW_FACTOR).max(GC_FIRST_THRESHOLD);
        debug!(
            before,
            after = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc sweep"
        );
    }
}

/// Visits every value directly held by `data`.
fn for_each_child(data: &HeapData, f: &mut impl FnMut(Value)) {
    let mut id = |id: HeapId, f: &mut dyn FnMut(Value)| f(Value::Ref(id));
    match data {
        HeapData::Str(_) | HeapData::Bytes(_) | HeapData::Native(_) | HeapData::Moved => {}
        HeapData::Tuple(t) => t.items.iter().for_each(|&v| f(v)),
        HeapData::List(l) => l.items.iter().for_each(|&v| f(v)),
        HeapData::Dict(d) => {
            for (k, v) in d.entries.iter() {
                f(k);
                f(v);
            }
        }
        HeapData::Set(s) => {
            for (k, v) in s.entries.iter() {
                f(k);
                f(v);
            }
        }
        HeapData::Function(func) => {
            func.chunk.constants.iter().for_each(|&v| f(v));
            if let Some(filename) = func.chunk.filename {
                id(filename, f);
            }
            if let Some(name) = func.name {
                id(name, f);
            }
            if let Some(doc) = func.docstring {
                id(doc, f);
            }
            func.required_args.iter().for_each(|&n| id(n, f));
            func.keyword_args.iter().for_each(|&n| id(n, f));
            func.local_names.iter().for_each(|e| id(e.name, f));
            if let Some(globals) = func.globals {
                id(globals, f);
            }
        }
        HeapData::Closure(c) => {
            id(c.function, f);
            c.upvalues.iter().for_each(|&u| id(u, f));
        }
        HeapData::Upvalue(u) => f(u.closed),
        HeapData::Class(c) => {
            id(c.name, f);
            if let Some(filename) = c.filename {
                id(filename, f);
            }
            if let Some(doc) = c.docstring {
                id(doc, f);
            }
            if let Some(base) = c.base {
                id(base, f);
            }
            for (k, v) in c.methods.iter() {
                f(k);
                f(v);
            }
            for slot in c.cache.iter().flatten() {
                f(*slot);
            }
        }
        HeapData::Instance(i) => {
            id(i.class, f);
            for (k, v) in i.fields.iter() {
                f(k);
                f(v);
            }
        }
        HeapData::BoundMethod(b) => {
            f(b.receiver);
            f(b.method);
        }
        HeapData::Property(p) => f(p.method),
        HeapData::Generator(g) => {
            id(g.closure, f);
            g.stack.iter().for_each(|&v| f(v));
            f(g.result);
        }
    }
}

fn estimate_size(data: &HeapData) -> usize {
    let base = std::mem::size_of::<HeapEntry>();
    base + match data {
        HeapData::Str(s) => s.byte_len(),
        HeapData::Bytes(b) => b.bytes.len(),
        HeapData::Tuple(t) => t.items.len() * std::mem::size_of::<Value>(),
        HeapData::List(l) => l.items.capacity() * std::mem::size_of::<Value>(),
        HeapData::Dict(d) => d.entries.len() * 2 * std::mem::size_of::<Value>(),
        HeapData::Set(s) => s.entries.len() * 2 * std::mem::size_of::<Value>(),
        HeapData::Function(func) => {
            func.chunk.code.len() + func.chunk.constants.len() * std::mem::size_of::<Value>()
        }
        HeapData::Closure(c) => c.upvalues.len() * std::mem::size_of::<HeapId>(),
        HeapData::Generator(g) => g.stack.len() * std::mem::size_of::<Value>(),
        HeapData::Instance(i) => i.fields.len() * 2 * std::mem::size_of::<Value>(),
        _ => 0,
    }
}

impl Heap {
    fn content_hash(&self, data: &HeapData) -> Option<u32> {
        match data {
            HeapData::Str(s) => Some(fnv1a(s.as_str().as_bytes())),
            HeapData::Bytes(b) => Some(fnv1a(&b.bytes)),
            HeapData::Tuple(t) => {
                let mut hash = 0x811c_9dc5u32;
                for &item in t.items.iter() {
                    hash ^= self.hash_value(item);
                    hash = hash.wrapping_mul(0x0100_0193);
                }
                Some(hash)
            }
            _ => None,
        }
    }
}

#[inline]
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = 0x811c_9dc5u32;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[inline]
fn hash_i64(i: i64) -> u32 {
    let x = (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    (x >> 32) as u32 ^ x as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{InstanceObj, ListObj, TupleObj};

    #[test]
    fn interning_is_canonical() {
        let mut heap = Heap::new();
        let a = heap.intern("spam");
        let b = heap.intern("spam");
        let c = heap.take_string("spam".to_string());
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, heap.intern("eggs"));
    }

    #[test]
    fn tuple_hash_matches_equal_content() {
        let mut heap = Heap::new();
        let t1 = heap.allocate(HeapData::Tuple(TupleObj::new(vec![
            Value::Int(1),
            Value::Int(2),
        ])));
        let t2 = heap.allocate(HeapData::Tuple(TupleObj::new(vec![
            Value::Int(1),
            Value::Int(2),
        ])));
        assert!(heap.values_equal(Value::Ref(t1), Value::Ref(t2)));
        assert_eq!(
            heap.hash_value(Value::Ref(t1)),
            heap.hash_value(Value::Ref(t2))
        );
    }

    #[test]
    fn sweep_frees_unreachable_and_keeps_roots() {
        let mut heap = Heap::new();
        let live = heap.allocate(HeapData::List(ListObj::new(vec![Value::Int(1)])));
        let dead = heap.allocate(HeapData::List(ListObj::new(vec![Value::Int(2)])));
        let dead_str = heap.intern("ephemeral");

        heap.mark_value(Value::Ref(live));
        heap.trace_references();
        heap.sweep();

        assert!(matches!(heap.get(live), HeapData::List(_)));
        assert!(heap.slots[dead.index()].is_none());
        assert!(heap.slots[dead_str.index()].is_none());
        // The interned entry is gone too; re-interning mints a fresh object.
        let again = heap.intern("ephemeral");
        assert!(heap.slots[again.index()].is_some());
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::new();
        let class = heap.intern("placeholder");
        let a = heap.allocate(HeapData::Instance(InstanceObj::new(class)));
        let b = heap.allocate(HeapData::Instance(InstanceObj::new(class)));
        let key = heap.intern("other");
        // a.other = b; b.other = a
        heap.with_entry(a, |heap, data| {
            if let HeapData::Instance(inst) = data {
                inst.fields.set(heap, Value::Ref(key), Value::Ref(b));
            }
        });
        heap.with_entry(b, |heap, data| {
            if let HeapData::Instance(inst) = data {
                inst.fields.set(heap, Value::Ref(key), Value::Ref(a));
            }
        });

        heap.trace_references();
        heap.sweep();
        assert!(heap.slots[a.index()].is_none());
        assert!(heap.slots[b.index()].is_none());
    }
}
