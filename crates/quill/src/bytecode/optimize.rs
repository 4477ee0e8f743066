//! Constant-folding peephole pass.
//!
//! Runs over a finished chunk: instructions are decoded into a flat list,
//! then two rewrites apply repeatedly until nothing changes:
//!
//! - a constant push followed by `NEGATE`/`NOT`/`STRINGIFY` becomes the
//!   precomputed constant;
//! - two constant pushes followed by a binary operator become the
//!   precomputed constant. Number/number arithmetic and string/string
//!   concatenation are the only typed folds; `EQUAL` folds for any pair of
//!   concrete constants.
//!
//! A fold never spans a jump target: the second and third instructions of a
//! candidate group must not be targeted by any jump, so every control-flow
//! edge still lands on an instruction boundary afterwards. Folding shrinks
//! the chunk, so the pass finishes by rebuilding every jump displacement
//! from an old-offset → new-offset map. Source tokens are preserved on the
//! surviving instructions. The pass is idempotent: re-running it on its own
//! output changes nothing.

use ahash::{AHashMap, AHashSet};

use super::{builder::constants_identical, chunk::Chunk, op::Opcode};
use crate::{
    intern::Interner,
    token::Token,
    value::{Value, format_num},
};

/// Optimizes `chunk`, returning the rewritten chunk.
///
/// Needs the interner because string folds (concatenation, stringify)
/// produce new interned literals.
pub fn optimize(chunk: &Chunk, interns: &mut Interner) -> Chunk {
    let mut insts = decode(chunk);
    let targets = jump_targets(&insts, chunk.code().len());
    let mut constants = chunk.constants().to_vec();

    let mut changed = true;
    while changed {
        changed = false;
        let mut out: Vec<Inst> = Vec::with_capacity(insts.len());
        let mut i = 0;
        while i < insts.len() {
            if i + 2 < insts.len()
                && !targets.contains(&insts[i + 1].old_offset)
                && !targets.contains(&insts[i + 2].old_offset)
                && let (Some(lhs), Some(rhs)) = (
                    constant_value(&insts[i], &constants),
                    constant_value(&insts[i + 1], &constants),
                )
                && let Some(folded) = fold_binary(lhs, insts[i + 2].op, rhs, interns)
            {
                out.push(make_constant(folded, &insts[i], &mut constants));
                i += 3;
                changed = true;
                continue;
            }
            if i + 1 < insts.len()
                && !targets.contains(&insts[i + 1].old_offset)
                && let Some(operand) = constant_value(&insts[i], &constants)
                && let Some(folded) = fold_unary(insts[i + 1].op, operand, interns)
            {
                out.push(make_constant(folded, &insts[i], &mut constants));
                i += 2;
                changed = true;
                continue;
            }
            out.push(insts[i].clone());
            i += 1;
        }
        insts = out;
    }

    encode(&insts, constants, chunk.code().len())
}

/// One decoded instruction.
#[derive(Debug, Clone)]
struct Inst {
    op: Opcode,
    /// Full encoding: opcode byte plus operand bytes.
    bytes: Vec<u8>,
    token: Token,
    old_offset: usize,
    /// Absolute target in old offsets, for jump instructions.
    jump_target: Option<usize>,
}

fn decode(chunk: &Chunk) -> Vec<Inst> {
    let code = chunk.code();
    let mut insts = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let op = Opcode::at(code, offset);
        let len = 1 + op.operand_len(code, offset);
        let jump_target = if op.is_jump() {
            let delta = chunk.read_u16(offset + 1) as usize;
            Some(if op == Opcode::Loop {
                offset + 3 - delta
            } else {
                offset + 3 + delta
            })
        } else {
            None
        };
        insts.push(Inst {
            op,
            bytes: code[offset..offset + len].to_vec(),
            token: chunk.token_at(offset),
            old_offset: offset,
            jump_target,
        });
        offset += len;
    }
    insts
}

fn jump_targets(insts: &[Inst], code_len: usize) -> AHashSet<usize> {
    let mut targets = AHashSet::new();
    for inst in insts {
        if let Some(target) = inst.jump_target {
            targets.insert(target);
        }
    }
    // A forward jump patched at the very end of the chunk targets `code_len`;
    // keep it representable in the offset map.
    targets.insert(code_len);
    targets
}

/// Extracts the value pushed by a constant-pushing instruction.
fn constant_value(inst: &Inst, constants: &[Value]) -> Option<Value> {
    match inst.op {
        Opcode::Null => Some(Value::Null),
        Opcode::True => Some(Value::Bool(true)),
        Opcode::False => Some(Value::Bool(false)),
        Opcode::Constant => {
            let index = u16::from_be_bytes([inst.bytes[1], inst.bytes[2]]);
            constants.get(index as usize).copied()
        }
        _ => None,
    }
}

/// Builds the replacement constant-push instruction for a folded value.
fn make_constant(value: Value, first: &Inst, constants: &mut Vec<Value>) -> Inst {
    let (op, bytes) = match value {
        Value::Null => (Opcode::Null, vec![Opcode::Null as u8]),
        Value::Bool(true) => (Opcode::True, vec![Opcode::True as u8]),
        Value::Bool(false) => (Opcode::False, vec![Opcode::False as u8]),
        other => {
            let index = constants
                .iter()
                .position(|&c| constants_identical(c, other))
                .unwrap_or_else(|| {
                    constants.push(other);
                    constants.len() - 1
                });
            let index = u16::try_from(index).expect("constant pool exceeds u16 range during folding");
            let be = index.to_be_bytes();
            (Opcode::Constant, vec![Opcode::Constant as u8, be[0], be[1]])
        }
    };
    Inst {
        op,
        bytes,
        token: first.token,
        old_offset: first.old_offset,
        jump_target: None,
    }
}

fn fold_unary(op: Opcode, operand: Value, interns: &mut Interner) -> Option<Value> {
    match op {
        Opcode::Negate => match operand {
            Value::Num(n) => Some(Value::Num(-n)),
            _ => None,
        },
        Opcode::Not => Some(Value::Bool(!operand.is_truthy())),
        Opcode::Stringify => match operand {
            Value::Str(_) => Some(operand),
            Value::Null => Some(Value::Str(interns.intern("null"))),
            Value::Bool(b) => Some(Value::Str(interns.intern(if b { "true" } else { "false" }))),
            Value::Num(n) => Some(Value::Str(interns.intern(&format_num(n)))),
            _ => None,
        },
        _ => None,
    }
}

fn fold_binary(lhs: Value, op: Opcode, rhs: Value, interns: &mut Interner) -> Option<Value> {
    match op {
        Opcode::Add => match (lhs, rhs) {
            (Value::Num(a), Value::Num(b)) => Some(Value::Num(a + b)),
            (Value::Str(a), Value::Str(b)) => {
                let joined = format!("{}{}", interns.get(a), interns.get(b));
                Some(Value::Str(interns.intern(&joined)))
            }
            _ => None,
        },
        Opcode::Subtract => num_fold(lhs, rhs, |a, b| a - b),
        Opcode::Multiply => num_fold(lhs, rhs, |a, b| a * b),
        // Division by zero stays a runtime error; never fold it away.
        Opcode::Divide => match (lhs, rhs) {
            (Value::Num(a), Value::Num(b)) if b != 0.0 => Some(Value::Num(a / b)),
            _ => None,
        },
        Opcode::Modulo => match (lhs, rhs) {
            (Value::Num(a), Value::Num(b)) if b != 0.0 => Some(Value::Num(a % b)),
            _ => None,
        },
        Opcode::Equal => Some(Value::Bool(lhs == rhs)),
        Opcode::Greater => cmp_fold(lhs, rhs, |a, b| a > b),
        Opcode::GreaterEqual => cmp_fold(lhs, rhs, |a, b| a >= b),
        Opcode::Less => cmp_fold(lhs, rhs, |a, b| a < b),
        Opcode::LessEqual => cmp_fold(lhs, rhs, |a, b| a <= b),
        _ => None,
    }
}

fn num_fold(lhs: Value, rhs: Value, f: impl FnOnce(f64, f64) -> f64) -> Option<Value> {
    match (lhs, rhs) {
        (Value::Num(a), Value::Num(b)) => Some(Value::Num(f(a, b))),
        _ => None,
    }
}

fn cmp_fold(lhs: Value, rhs: Value, f: impl FnOnce(f64, f64) -> bool) -> Option<Value> {
    match (lhs, rhs) {
        (Value::Num(a), Value::Num(b)) => Some(Value::Bool(f(a, b))),
        _ => None,
    }
}

/// Re-emits the instruction list, rebuilding jump displacements.
fn encode(insts: &[Inst], constants: Vec<Value>, old_code_len: usize) -> Chunk {
    let mut new_offsets: AHashMap<usize, usize> = AHashMap::with_capacity(insts.len() + 1);
    let mut offset = 0;
    for inst in insts {
        new_offsets.insert(inst.old_offset, offset);
        offset += inst.bytes.len();
    }
    new_offsets.insert(old_code_len, offset);

    let mut code = Vec::with_capacity(offset);
    let mut tokens = Vec::with_capacity(offset);
    for inst in insts {
        let at = code.len();
        code.extend_from_slice(&inst.bytes);
        if let Some(old_target) = inst.jump_target {
            let new_target = *new_offsets
                .get(&old_target)
                .expect("jump target folded away; target guard violated");
            let delta = if inst.op == Opcode::Loop {
                (at + 3) - new_target
            } else {
                new_target - (at + 3)
            };
            let delta = u16::try_from(delta).expect("rebuilt jump offset exceeds u16 range");
            let be = delta.to_be_bytes();
            code[at + 1] = be[0];
            code[at + 2] = be[1];
        }
        for _ in 0..inst.bytes.len() {
            tokens.push(inst.token);
        }
    }
    Chunk::new(code, tokens, constants)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bytecode::ChunkBuilder;

    fn interner() -> Interner {
        Interner::new()
    }

    fn optimize_twice_and_compare(chunk: &Chunk, interns: &mut Interner) -> Chunk {
        let once = optimize(chunk, interns);
        let twice = optimize(&once, interns);
        assert_eq!(once.code(), twice.code(), "optimizer must be idempotent");
        assert_eq!(once.constants(), twice.constants());
        once
    }

    #[test]
    fn folds_unary_negate() {
        let mut interns = interner();
        let mut builder = ChunkBuilder::new();
        builder.emit_constant(Value::Num(2.0));
        builder.emit(Opcode::Negate);
        builder.emit(Opcode::Return);
        let chunk = optimize_twice_and_compare(&builder.build(), &mut interns);
        assert_eq!(chunk.code(), &[Opcode::Constant as u8, 0, 1, Opcode::Return as u8]);
        assert_eq!(chunk.constant(1), Value::Num(-2.0));
    }

    #[test]
    fn folds_binary_chains_to_fixpoint() {
        let mut interns = interner();
        let mut builder = ChunkBuilder::new();
        // 1 + 2 * 3
        builder.emit_constant(Value::Num(1.0));
        builder.emit_constant(Value::Num(2.0));
        builder.emit_constant(Value::Num(3.0));
        builder.emit(Opcode::Multiply);
        builder.emit(Opcode::Add);
        builder.emit(Opcode::Return);
        let chunk = optimize_twice_and_compare(&builder.build(), &mut interns);
        // Intermediate folds append 6.0 then 7.0 to the pool.
        assert_eq!(
            chunk.code(),
            &[Opcode::Constant as u8, 0, 4, Opcode::Return as u8]
        );
        assert_eq!(chunk.constant(4), Value::Num(7.0));
    }

    #[test]
    fn folds_string_concatenation() {
        let mut interns = interner();
        let a = interns.intern("foo");
        let b = interns.intern("bar");
        let mut builder = ChunkBuilder::new();
        builder.emit_constant(Value::Str(a));
        builder.emit_constant(Value::Str(b));
        builder.emit(Opcode::Add);
        builder.emit(Opcode::Return);
        let chunk = optimize_twice_and_compare(&builder.build(), &mut interns);
        let folded = chunk.constant(chunk.read_u16(1));
        let Value::Str(id) = folded else {
            panic!("expected interned string constant");
        };
        assert_eq!(interns.get(id), "foobar");
    }

    #[test]
    fn folds_equal_for_any_constants() {
        let mut interns = interner();
        let mut builder = ChunkBuilder::new();
        builder.emit_constant(Value::Bool(true));
        builder.emit_constant(Value::Null);
        builder.emit(Opcode::Equal);
        builder.emit(Opcode::Return);
        let chunk = optimize_twice_and_compare(&builder.build(), &mut interns);
        assert_eq!(chunk.code(), &[Opcode::False as u8, Opcode::Return as u8]);
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let mut interns = interner();
        let mut builder = ChunkBuilder::new();
        builder.emit_constant(Value::Num(1.0));
        builder.emit_constant(Value::Num(0.0));
        builder.emit(Opcode::Divide);
        builder.emit(Opcode::Return);
        let original = builder.build();
        let chunk = optimize_twice_and_compare(&original, &mut interns);
        assert_eq!(chunk.code(), original.code());
    }

    #[test]
    fn never_folds_across_a_jump_target() {
        let mut interns = interner();
        let mut builder = ChunkBuilder::new();
        // JUMP lands between the two constants: the pair must survive.
        let jump = builder.emit_jump(Opcode::Jump);
        builder.emit_constant(Value::Num(1.0));
        builder.patch_jump(jump);
        builder.emit_constant(Value::Num(2.0));
        builder.emit(Opcode::Add);
        builder.emit(Opcode::Return);
        let original = builder.build();
        let chunk = optimize_twice_and_compare(&original, &mut interns);
        assert_eq!(chunk.code(), original.code());
        chunk.verify_jump_targets().unwrap();
    }

    #[test]
    fn rebuilds_jump_offsets_after_shrinking() {
        let mut interns = interner();
        let mut builder = ChunkBuilder::new();
        // if-like shape: condition is foldable, jump skips over more
        // foldable code; after folding both regions shrink and the
        // displacement must be rebuilt.
        builder.emit_constant(Value::Num(1.0));
        builder.emit_constant(Value::Num(2.0));
        builder.emit(Opcode::Less);
        let jump = builder.emit_jump(Opcode::JumpIfFalse);
        builder.emit_constant(Value::Num(3.0));
        builder.emit_constant(Value::Num(4.0));
        builder.emit(Opcode::Add);
        builder.emit(Opcode::Pop);
        builder.patch_jump(jump);
        builder.emit(Opcode::Return);
        let chunk = optimize_twice_and_compare(&builder.build(), &mut interns);
        chunk.verify_jump_targets().unwrap();
        // Shape: TRUE, JUMP_IF_FALSE -> return, CONSTANT(7), POP, RETURN.
        assert_eq!(Opcode::at(chunk.code(), 0), Opcode::True);
        assert_eq!(Opcode::at(chunk.code(), 1), Opcode::JumpIfFalse);
        let delta = chunk.read_u16(2) as usize;
        assert_eq!(Opcode::at(chunk.code(), 4 + delta), Opcode::Return);
    }

    #[test]
    fn loops_survive_with_correct_backward_offsets() {
        let mut interns = interner();
        let mut builder = ChunkBuilder::new();
        let start = builder.current_offset();
        builder.emit_constant(Value::Num(1.0));
        builder.emit(Opcode::Stringify);
        builder.emit(Opcode::Pop);
        builder.emit_loop(start);
        let chunk = optimize(&builder.build(), &mut interns);
        chunk.verify_jump_targets().unwrap();
        // The constant+stringify pair folded; the loop still targets offset 0.
        assert_eq!(Opcode::at(chunk.code(), 0), Opcode::Constant);
        let loop_at = 4;
        assert_eq!(Opcode::at(chunk.code(), loop_at), Opcode::Loop);
        assert_eq!(chunk.read_u16(loop_at + 1) as usize, loop_at + 3);
    }
}
