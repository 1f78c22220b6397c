//! Binary operator dispatch.
//!
//! Arithmetic and comparison instructions first try direct paths on ints,
//! floats and the builtin containers, then fall back to the operand classes'
//! dunder slots: the left operand's method first, then the right operand's
//! reflected method when the left returns the not-implemented sentinel.
//! Integer arithmetic is checked, so overflow raises `OverflowError` rather
//! than wrapping, and division and modulo follow floored semantics.

use num_integer::Integer;

use crate::chunk::OpCode;
use crate::heap::HeapData;
use crate::objects::Special;
use crate::value::{values_same, Value};

use super::{Raised, Vm, VmResult};

impl Vm {
    /// The sentinel a dunder returns to decline an operation.
    pub(crate) fn not_implemented_value(&self) -> Value {
        Value::Ref(self.exceptions.not_implemented_error)
    }

    pub(crate) fn is_not_implemented(&self, v: Value) -> bool {
        values_same(v, self.not_implemented_value())
    }

    pub(crate) fn binary_operator(&mut self, op: OpCode, a: Value, b: Value) -> VmResult<Value> {
        if let Some(result) = self.fast_binary(op, a, b)? {
            return Ok(result);
        }
        let (special, reflected, symbol) = match op {
            OpCode::Add => (Special::Add, Special::RAdd, "+"),
            OpCode::Subtract => (Special::Sub, Special::RSub, "-"),
            OpCode::Multiply => (Special::Mul, Special::RMul, "*"),
            OpCode::Divide => (Special::Div, Special::RDiv, "/"),
            OpCode::Modulo => (Special::Mod, Special::RMod, "%"),
            OpCode::Pow => (Special::Pow, Special::RPow, "**"),
            OpCode::BitAnd => (Special::BitAnd, Special::RBitAnd, "&"),
            OpCode::BitOr => (Special::BitOr, Special::RBitOr, "|"),
            OpCode::BitXor => (Special::BitXor, Special::RBitXor, "^"),
            OpCode::ShiftLeft => (Special::Lshift, Special::RLshift, "<<"),
            OpCode::ShiftRight => (Special::Rshift, Special::RRshift, ">>"),
            OpCode::Less => (Special::Lt, Special::Gt, "<"),
            OpCode::Greater => (Special::Gt, Special::Lt, ">"),
            _ => unreachable!("not a binary operator: {op}"),
        };
        self.dispatch_binary(special, reflected, symbol, a, b)
    }

    /// Direct implementations for the builtin types; `Ok(None)` means "use
    /// dunder dispatch".
    fn fast_binary(&mut self, op: OpCode, a: Value, b: Value) -> VmResult<Option<Value>> {
        // Integer (and bool) pairs.
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            if !matches!((a, b), (Value::Float(_), _) | (_, Value::Float(_))) {
                return self.int_binary(op, x, y).map(Some);
            }
        }
        // Mixed numeric promotes to float.
        if let (Some(x), Some(y)) = (a.as_float(), b.as_float()) {
            return self.float_binary(op, x, y).map(Some);
        }

        // Containers and strings: build the owned result first (immutable
        // heap reads), then allocate.
        enum Built {
            Str(String),
            List(Vec<Value>),
            Bytes(Vec<u8>),
            Tuple(Vec<Value>),
            Value(Value),
        }
        let built = match (op, a.as_ref_id(), b.as_ref_id()) {
            (OpCode::Add, Some(x), Some(y)) => match (self.heap.get(x), self.heap.get(y)) {
                (HeapData::Str(p), HeapData::Str(q)) => {
                    Some(Built::Str(format!("{}{}", p.as_str(), q.as_str())))
                }
                (HeapData::List(p), HeapData::List(q)) => {
                    let mut items = p.items.clone();
                    items.extend(q.items.iter().copied());
                    Some(Built::List(items))
                }
                (HeapData::Bytes(p), HeapData::Bytes(q)) => {
                    let mut bytes = p.bytes.to_vec();
                    bytes.extend_from_slice(&q.bytes);
                    Some(Built::Bytes(bytes))
                }
                (HeapData::Tuple(p), HeapData::Tuple(q)) => {
                    let mut items = p.items.to_vec();
                    items.extend(q.items.iter().copied());
                    Some(Built::Tuple(items))
                }
                _ => None,
            },
            (OpCode::Multiply, Some(x), None) => repeat_value(self, x, b),
            (OpCode::Multiply, None, Some(y)) => repeat_value(self, y, a),
            (OpCode::Less, Some(x), Some(y)) => match (self.heap.get(x), self.heap.get(y)) {
                (HeapData::Str(p), HeapData::Str(q)) => {
                    Some(Built::Value(Value::Bool(p.as_str() < q.as_str())))
                }
                _ => None,
            },
            (OpCode::Greater, Some(x), Some(y)) => match (self.heap.get(x), self.heap.get(y)) {
                (HeapData::Str(p), HeapData::Str(q)) => {
                    Some(Built::Value(Value::Bool(p.as_str() > q.as_str())))
                }
                _ => None,
            },
            _ => None,
        };
        return Ok(match built {
            Some(Built::Str(s)) => Some(self.take_string(s)),
            Some(Built::List(items)) => Some(self.new_list(items)),
            Some(Built::Bytes(bytes)) => Some(self.new_bytes(bytes)),
            Some(Built::Tuple(items)) => Some(self.new_tuple(items)),
            Some(Built::Value(v)) => Some(v),
            None => None,
        });

        /// `str * n` and `list * n`, as owned data.
        fn repeat_value(vm: &Vm, container: crate::heap::HeapId, count: Value) -> Option<Built> {
            let n = count.as_int()?.max(0) as usize;
            match vm.heap.get(container) {
                HeapData::Str(s) => Some(Built::Str(s.as_str().repeat(n))),
                HeapData::List(l) => {
                    let mut items = Vec::with_capacity(l.items.len() * n);
                    for _ in 0..n {
                        items.extend(l.items.iter().copied());
                    }
                    Some(Built::List(items))
                }
                _ => None,
            }
        }
    }

    fn int_binary(&mut self, op: OpCode, x: i64, y: i64) -> VmResult<Value> {
        let overflow = |vm: &mut Vm| {
            vm.runtime_error(
                vm.exceptions.overflow_error,
                "integer arithmetic overflows",
            )
        };
        Ok(match op {
            OpCode::Add => Value::Int(x.checked_add(y).ok_or_else(|| overflow(self))?),
            OpCode::Subtract => Value::Int(x.checked_sub(y).ok_or_else(|| overflow(self))?),
            OpCode::Multiply => Value::Int(x.checked_mul(y).ok_or_else(|| overflow(self))?),
            OpCode::Divide => {
                if y == 0 {
                    return Err(self.zero_division("integer division or modulo by zero"));
                }
                if x == i64::MIN && y == -1 {
                    return Err(overflow(self));
                }
                Value::Int(x.div_floor(&y))
            }
            OpCode::Modulo => {
                if y == 0 {
                    return Err(self.zero_division("integer division or modulo by zero"));
                }
                if x == i64::MIN && y == -1 {
                    Value::Int(0)
                } else {
                    Value::Int(x.mod_floor(&y))
                }
            }
            OpCode::Pow => {
                if y < 0 {
                    Value::Float((x as f64).powf(y as f64))
                } else {
                    let exp = u32::try_from(y).map_err(|_| overflow(self))?;
                    Value::Int(x.checked_pow(exp).ok_or_else(|| overflow(self))?)
                }
            }
            OpCode::BitAnd => Value::Int(x & y),
            OpCode::BitOr => Value::Int(x | y),
            OpCode::BitXor => Value::Int(x ^ y),
            OpCode::ShiftLeft => {
                let shift = self.shift_amount(y)?;
                Value::Int(x.checked_shl(shift).ok_or_else(|| overflow(self))?)
            }
            OpCode::ShiftRight => {
                let shift = self.shift_amount(y)?;
                Value::Int(x >> shift.min(63))
            }
            OpCode::Less => Value::Bool(x < y),
            OpCode::Greater => Value::Bool(x > y),
            _ => unreachable!(),
        })
    }

    fn float_binary(&mut self, op: OpCode, x: f64, y: f64) -> VmResult<Value> {
        Ok(match op {
            OpCode::Add => Value::Float(x + y),
            OpCode::Subtract => Value::Float(x - y),
            OpCode::Multiply => Value::Float(x * y),
            OpCode::Divide => {
                if y == 0.0 {
                    return Err(self.zero_division("float division by zero"));
                }
                Value::Float(x / y)
            }
            OpCode::Modulo => {
                if y == 0.0 {
                    return Err(self.zero_division("float division by zero"));
                }
                Value::Float(x - (x / y).floor() * y)
            }
            OpCode::Pow => Value::Float(x.powf(y)),
            OpCode::Less => Value::Bool(x < y),
            OpCode::Greater => Value::Bool(x > y),
            OpCode::BitAnd
            | OpCode::BitOr
            | OpCode::BitXor
            | OpCode::ShiftLeft
            | OpCode::ShiftRight => {
                return Err(self.runtime_error(
                    self.exceptions.type_error,
                    "unsupported operand type for bitwise operation: 'float'",
                ))
            }
            _ => unreachable!(),
        })
    }

    fn shift_amount(&mut self, y: i64) -> VmResult<u32> {
        if y < 0 {
            return Err(self.runtime_error(self.exceptions.value_error, "negative shift count"));
        }
        u32::try_from(y).map_err(|_| {
            self.runtime_error(self.exceptions.overflow_error, "shift count too large")
        })
    }

    fn zero_division(&mut self, message: &str) -> Raised {
        self.runtime_error(self.exceptions.zero_division_error, message.to_string())
    }

    fn dispatch_binary(
        &mut self,
        special: Special,
        reflected: Special,
        symbol: &str,
        a: Value,
        b: Value,
    ) -> VmResult<Value> {
        if let Some(method) = self.special_of(a, special) {
            self.push(a);
            self.push(b);
            let result = self.call_simple(method, 2)?;
            if !self.is_not_implemented(result) {
                return Ok(result);
            }
        }
        if let Some(method) = self.special_of(b, reflected) {
            self.push(b);
            self.push(a);
            let result = self.call_simple(method, 2)?;
            if !self.is_not_implemented(result) {
                return Ok(result);
            }
        }
        let left = self.type_name(a).to_string();
        let right = self.type_name(b).to_string();
        Err(self.runtime_error(
            self.exceptions.type_error,
            format!("unsupported operand type(s) for {symbol}: '{left}' and '{right}'"),
        ))
    }

    /// Language-level `==`: structural equality first, then `__eq__` with
    /// reflected fallback for instances.
    pub(crate) fn values_equal_dispatch(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if self.heap.values_equal(a, b) {
            return Ok(true);
        }
        let is_instance = |vm: &Vm, v: Value| {
            matches!(
                v.as_ref_id().map(|id| vm.heap.get(id)),
                Some(HeapData::Instance(_))
            )
        };
        if is_instance(self, a) {
            if let Some(eq) = self.special_of(a, Special::Eq) {
                self.push(a);
                self.push(b);
                let result = self.call_simple(eq, 2)?;
                if !self.is_not_implemented(result) {
                    return Ok(!self.is_falsey(result));
                }
            }
        }
        if is_instance(self, b) {
            if let Some(eq) = self.special_of(b, Special::Eq) {
                self.push(b);
                self.push(a);
                let result = self.call_simple(eq, 2)?;
                if !self.is_not_implemented(result) {
                    return Ok(!self.is_falsey(result));
                }
            }
        }
        Ok(false)
    }
}
