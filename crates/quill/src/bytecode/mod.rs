//! Bytecode representation and tooling.
//!
//! - `op` — opcode enum and operand widths
//! - `chunk` — compiled code: bytes, per-byte source tokens, inline-cache
//!   slots, constant pool, disassembler
//! - `builder` — `ChunkBuilder` for emitting bytecode during compilation
//! - `optimize` — post-compilation constant-folding peephole pass
//!
//! Multi-byte operands are big-endian. Jumps are unsigned 16-bit relative
//! displacements: forward for `Jump`/`JumpIfFalse`, backward for `Loop`,
//! measured from the end of the jump instruction.

pub use builder::{ChunkBuilder, JumpLabel};
pub use chunk::{Chunk, InlineCache};
pub use op::Opcode;
pub use optimize::optimize;

mod builder;
mod chunk;
mod op;
mod optimize;
