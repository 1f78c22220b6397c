//! Classes and instances.
//!
//! A class keeps its methods and class-level fields in value-keyed tables and
//! additionally caches every protocol method in an array indexed by
//! [`Special`]. The cache is rebuilt by `finalize_class` after a class body
//! finishes (or whenever a special-looking attribute is assigned), so the VM
//! can reach `__init__`, `__repr__`, operator hooks and the rest without a
//! table walk.

use strum::EnumCount;

use crate::heap::HeapId;
use crate::table::ValueTable;
use crate::value::Value;

/// Protocol methods cached on every class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumCount, strum::FromRepr)]
#[repr(usize)]
pub(crate) enum Special {
    Init,
    Repr,
    Str,
    Call,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Hash,
    Len,
    Iter,
    Getter,
    Setter,
    DelItem,
    GetSlice,
    SetSlice,
    DelSlice,
    Enter,
    Exit,
    GetAttr,
    Dir,
    Contains,
    Add,
    RAdd,
    Sub,
    RSub,
    Mul,
    RMul,
    Div,
    RDiv,
    Mod,
    RMod,
    Pow,
    RPow,
    BitAnd,
    RBitAnd,
    BitOr,
    RBitOr,
    BitXor,
    RBitXor,
    Lshift,
    RLshift,
    Rshift,
    RRshift,
}

impl Special {
    pub fn method_name(self) -> &'static str {
        match self {
            Special::Init => "__init__",
            Special::Repr => "__repr__",
            Special::Str => "__str__",
            Special::Call => "__call__",
            Special::Eq => "__eq__",
            Special::Ne => "__ne__",
            Special::Lt => "__lt__",
            Special::Gt => "__gt__",
            Special::Le => "__le__",
            Special::Ge => "__ge__",
            Special::Hash => "__hash__",
            Special::Len => "__len__",
            Special::Iter => "__iter__",
            Special::Getter => "__getitem__",
            Special::Setter => "__setitem__",
            Special::DelItem => "__delitem__",
            Special::GetSlice => "__getslice__",
            Special::SetSlice => "__setslice__",
            Special::DelSlice => "__delslice__",
            Special::Enter => "__enter__",
            Special::Exit => "__exit__",
            Special::GetAttr => "__getattr__",
            Special::Dir => "__dir__",
            Special::Contains => "__contains__",
            Special::Add => "__add__",
            Special::RAdd => "__radd__",
            Special::Sub => "__sub__",
            Special::RSub => "__rsub__",
            Special::Mul => "__mul__",
            Special::RMul => "__rmul__",
            Special::Div => "__truediv__",
            Special::RDiv => "__rtruediv__",
            Special::Mod => "__mod__",
            Special::RMod => "__rmod__",
            Special::Pow => "__pow__",
            Special::RPow => "__rpow__",
            Special::BitAnd => "__and__",
            Special::RBitAnd => "__rand__",
            Special::BitOr => "__or__",
            Special::RBitOr => "__ror__",
            Special::BitXor => "__xor__",
            Special::RBitXor => "__rxor__",
            Special::Lshift => "__lshift__",
            Special::RLshift => "__rlshift__",
            Special::Rshift => "__rshift__",
            Special::RRshift => "__rrshift__",
        }
    }

    pub fn all() -> impl Iterator<Item = Special> {
        (0..Special::COUNT).map(|i| Special::from_repr(i).expect("in range"))
    }
}

#[derive(Debug)]
pub(crate) struct ClassObj {
    pub name: HeapId,
    pub filename: Option<HeapId>,
    pub docstring: Option<HeapId>,
    pub base: Option<HeapId>,
    /// Methods and class statics both live here; instances get their own
    /// field tables.
    pub methods: ValueTable,
    pub cache: [Option<Value>; Special::COUNT],
}

impl ClassObj {
    pub fn new(name: HeapId, base: Option<HeapId>) -> Self {
        Self {
            name,
            filename: None,
            docstring: None,
            base,
            methods: ValueTable::new(),
            cache: [None; Special::COUNT],
        }
    }

    #[inline]
    pub fn special(&self, which: Special) -> Option<Value> {
        self.cache[which as usize]
    }
}

#[derive(Debug)]
pub(crate) struct InstanceObj {
    pub class: HeapId,
    pub fields: ValueTable,
}

impl InstanceObj {
    pub fn new(class: HeapId) -> Self {
        Self {
            class,
            fields: ValueTable::new(),
        }
    }
}
