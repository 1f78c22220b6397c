//! Bytecode disassembler.
//!
//! Renders instructions using the normative opcode numbering: the operand
//! width comes from the opcode byte's top two bits, and `Closure`
//! instructions are followed by their upvalue descriptors. Values print in
//! their primitive form only; disassembly never calls managed code.

use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::heap::{Heap, HeapData};
use crate::value::Value;

pub(crate) fn disassemble_chunk(chunk: &Chunk, heap: &Heap, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, heap, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// One instruction; returns its rendering and the next offset.
pub(crate) fn disassemble_instruction(chunk: &Chunk, heap: &Heap, offset: usize) -> (String, usize) {
    let mut out = String::new();
    let line = chunk.line_for_offset(offset);
    let same_line = offset > 0 && chunk.line_for_offset(offset - 1) == line;
    if same_line {
        let _ = write!(out, "{offset:04}    | ");
    } else {
        let _ = write!(out, "{offset:04} {line:4} ");
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_repr(byte) else {
        let _ = write!(out, "<unknown {byte:#04x}>");
        return (out, offset + 1);
    };

    let width = op.operand_width();
    let mut operand = 0usize;
    for i in 0..width {
        operand = operand << 8 | usize::from(chunk.code[offset + 1 + i]);
    }
    let mut next = offset + 1 + width;

    match width {
        0 => {
            let _ = write!(out, "{op}");
        }
        2 => {
            // Jump targets display resolved against the following offset.
            let target = match op {
                OpCode::Loop => next - operand,
                _ => next + operand,
            };
            let _ = write!(out, "{op} {operand} (to {target})");
        }
        _ => {
            let _ = write!(out, "{op} {operand}");
            if matches!(
                op,
                OpCode::Constant
                    | OpCode::ConstantLong
                    | OpCode::Closure
                    | OpCode::ClosureLong
                    | OpCode::GetGlobal
                    | OpCode::GetGlobalLong
                    | OpCode::SetGlobal
                    | OpCode::SetGlobalLong
                    | OpCode::DefineGlobal
                    | OpCode::DefineGlobalLong
                    | OpCode::GetProperty
                    | OpCode::GetPropertyLong
                    | OpCode::SetProperty
                    | OpCode::SetPropertyLong
                    | OpCode::Method
                    | OpCode::MethodLong
                    | OpCode::Import
                    | OpCode::ImportLong
                    | OpCode::ImportFrom
                    | OpCode::ImportFromLong
            ) {
                if let Some(&constant) = chunk.constants.get(operand) {
                    let _ = write!(out, " {}", value_brief(heap, constant));
                }
            }
        }
    }

    // Closure instructions trail their upvalue descriptors.
    if matches!(op, OpCode::Closure | OpCode::ClosureLong) {
        if let Some(Value::Ref(id)) = chunk.constants.get(operand).copied() {
            if let HeapData::Function(f) = heap.get(id) {
                for _ in 0..f.upvalue_count {
                    let flags = chunk.code[next];
                    let index_width = if flags & 2 != 0 { 3 } else { 1 };
                    let mut index = 0usize;
                    for j in 0..index_width {
                        index = index << 8 | usize::from(chunk.code[next + 1 + j]);
                    }
                    next += 1 + index_width;
                    let kind = if flags & 1 != 0 { "local" } else { "upvalue" };
                    let _ = write!(out, " [{kind} {index}]");
                }
            }
        }
    }

    (out, next)
}

/// Primitive-only value rendering for operand annotations.
fn value_brief(heap: &Heap, v: Value) -> String {
    match v {
        Value::None => "None".to_string(),
        Value::Bool(b) => if b { "True" } else { "False" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => crate::vm::format_float(f),
        Value::Kwargs(n) => format!("<kwargs {n}>"),
        Value::Handler(h) => format!("<handler {:?}@{}>", h.kind, h.target),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => crate::objects::string_repr(s.as_str()),
            HeapData::Function(f) => {
                let name = f
                    .name
                    .map(|n| heap.str_content(n).to_string())
                    .unwrap_or_else(|| "<anonymous>".to_string());
                format!("<function {name}>")
            }
            other => format!("<{}>", other.kind_name()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;

    #[test]
    fn short_and_long_constants_disassemble_alike() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        for i in 0..300 {
            chunk.add_constant(Value::Int(i));
        }
        chunk.write_operand_op(OpCode::Constant, 255, 1);
        chunk.write_operand_op(OpCode::Constant, 256, 1);
        chunk.write_op(OpCode::Return, 1);

        let (first, next) = disassemble_instruction(&chunk, &heap, 0);
        assert!(first.contains("Constant 255"));
        let (second, next) = disassemble_instruction(&chunk, &heap, next);
        assert!(second.contains("ConstantLong 256"));
        let (third, _) = disassemble_instruction(&chunk, &heap, next);
        assert!(third.contains("Return"));
    }
}
