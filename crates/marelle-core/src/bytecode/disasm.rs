//! disasm.rs — Désassembleur lisible (humain).
//!
//! Outil de mise au point : alimente le mode trace de la VM et quelques
//! tests. Les constantes sont résolues à travers le tas et rendues en
//! commentaire `/* … */`, façon listing.

use std::fmt::Write as _;

use crate::bytecode::{Chunk, Op};
use crate::heap::Heap;
use crate::object::Obj;

/// Désassemble tout un chunk, une instruction par ligne.
pub fn disassemble(heap: &Heap, chunk: &Chunk, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "== {title} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_at(heap, chunk, offset);
        let _ = writeln!(&mut out, "{line}");
        offset = next;
    }
    out
}

/// Désassemble l'instruction à `offset`. Renvoie la ligne rendue et
/// l'offset de l'instruction suivante.
pub fn disassemble_at(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let line = chunk.lines.line_at(offset as u32).unwrap_or(0);
    let byte = chunk.code[offset];
    let Ok(op) = Op::try_from(byte) else {
        return (format!("{offset:05}  (ligne {line:>4})  ??? 0x{byte:02x}"), offset + 1);
    };
    let mut text = format!("{offset:05}  (ligne {line:>4})  {:<12}", op.mnemonic());
    let mut next = offset + 1 + op.operand_bytes();

    match op {
        Op::Constant | Op::DefineGlobal | Op::GetGlobal | Op::SetGlobal => {
            let index = chunk.code[offset + 1] as usize;
            let _ = write!(&mut text, "{index} /* {} */", render_constant(heap, chunk, index));
        }
        Op::ConstantLong => {
            let index = chunk.code[offset + 1] as usize
                | (chunk.code[offset + 2] as usize) << 8
                | (chunk.code[offset + 3] as usize) << 16;
            let _ = write!(&mut text, "{index} /* {} */", render_constant(heap, chunk, index));
        }
        Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue | Op::Call
        | Op::TailCall => {
            let _ = write!(&mut text, "{}", chunk.code[offset + 1]);
        }
        Op::JumpIf | Op::Jump | Op::Loop => {
            let jump =
                u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as usize;
            let target = if op == Op::Loop { offset + 3 - jump } else { offset + 3 + jump };
            let _ = write!(&mut text, "{jump} -> {target:05}");
        }
        Op::Closure => {
            let index = chunk.code[offset + 1] as usize;
            let _ = write!(&mut text, "{index} /* {} */", render_constant(heap, chunk, index));
            // Les descripteurs d'upvalues suivent l'opcode.
            let count = chunk.constants[index]
                .as_handle()
                .map_or(0, |h| heap.function(h).upvalue_count);
            for i in 0..count {
                let is_local = chunk.code[next] != 0;
                let slot = chunk.code[next + 1];
                let kind = if is_local { "local" } else { "upvalue" };
                let _ = write!(&mut text, " [{i}: {kind} {slot}]");
                next += 2;
            }
        }
        _ => {}
    }
    (text, next)
}

fn render_constant(heap: &Heap, chunk: &Chunk, index: usize) -> String {
    match chunk.constants.get(index) {
        Some(&value) => match value.as_handle() {
            Some(h) => match heap.get(h) {
                Obj::Str(s) => format!("{:?}", &*s.chars),
                _ => heap.value_to_string(value),
            },
            None => heap.value_to_string(value),
        },
        None => "<constante invalide>".to_string(),
    }
}
