//! Bytecode: compact terms, opcode table, `Code` disassembly, generic walk.

/// Test-fixture assembler (module blobs from instructions).
#[cfg(any(test, feature = "fixtures"))]
pub mod asm;
/// `Code` chunk decoding and text rendering.
pub mod disasm;
/// Generic instruction set.
pub mod opcode;
/// Instruction walk with accumulator.
pub mod scan;
/// Compact term operands.
pub mod term;

pub use disasm::{disassemble, render, Code, CodeHeader, Function, Instruction};
pub use opcode::Opcode;
pub use scan::{scan, Location};
pub use term::Operand;
