//! `Code` chunk decoding: header, instruction stream, per-function split, text.

use core::fmt::Write;

use tracing::trace;

use super::{opcode::Opcode, term::{self, Operand}};
use crate::{ByteReader, CoreError, CoreResult};

/// Fixed part of the `Code` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeHeader {
    /// Size of the info block following the first word (16 today).
    pub info_size: u32,
    /// Instruction set version.
    pub instruction_set: u32,
    /// Highest opcode used by the module.
    pub opcode_max: u32,
    /// Number of labels.
    pub label_count: u32,
    /// Number of functions.
    pub function_count: u32,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Opcode.
    pub opcode: Opcode,
    /// Operands, exactly `opcode.arity()` of them.
    pub args: Vec<Operand>,
    /// Byte offset within the instruction stream.
    pub offset: usize,
}

impl Instruction {
    /// Argument `i` if it is an unsigned literal.
    pub fn unsigned_arg(&self, i: usize) -> Option<u64> {
        self.args.get(i).and_then(Operand::as_unsigned)
    }

    /// `ImpT` index carried by an external call or a bif, if any.
    pub fn import_index(&self) -> Option<u64> {
        match self.opcode {
            Opcode::CALL_EXT | Opcode::CALL_EXT_LAST | Opcode::CALL_EXT_ONLY => self.unsigned_arg(1),
            Opcode::BIF0 => self.unsigned_arg(0),
            Opcode::BIF1 | Opcode::BIF2 => self.unsigned_arg(1),
            Opcode::GC_BIF1 | Opcode::GC_BIF2 | Opcode::GC_BIF3 => self.unsigned_arg(2),
            _ => None,
        }
    }

    /// Bifs are called through `ImpT` but always owned by the runtime.
    pub fn is_bif(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::BIF0 | Opcode::BIF1 | Opcode::BIF2 | Opcode::GC_BIF1 | Opcode::GC_BIF2 | Opcode::GC_BIF3
        )
    }
}

/// A function: its `func_info` plus every instruction up to the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Function name.
    pub name: String,
    /// Arity.
    pub arity: u32,
    /// Instructions, leading labels/lines included.
    pub instructions: Vec<Instruction>,
}

/// Disassembled `Code` chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Code {
    /// Header.
    pub header: CodeHeader,
    /// Functions in code order.
    pub functions: Vec<Function>,
}

impl Code {
    /// Every instruction of every function.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.functions.iter().flat_map(|f| f.instructions.iter())
    }
}

/// Split the chunk into header and instruction stream.
pub fn parse_header(chunk: &[u8]) -> CoreResult<(CodeHeader, &[u8])> {
    let mut r = ByteReader::new(chunk);
    let info_size = r.read_u32_be().map_err(|_| CoreError::malformed("truncated Code header"))?;
    if info_size < 16 {
        return Err(CoreError::malformed(format!("Code info size {info_size} < 16")));
    }
    let mut info = ByteReader::new(
        r.read_bytes(info_size as usize)
            .map_err(|_| CoreError::malformed("Code header exceeds chunk"))?,
    );
    let header = CodeHeader {
        info_size,
        instruction_set: info.read_u32_be()?,
        opcode_max: info.read_u32_be()?,
        label_count: info.read_u32_be()?,
        function_count: info.read_u32_be()?,
    };
    Ok((header, r.rest()))
}

/// Decode the instruction stream up to `int_code_end` (or the end of input).
pub fn decode_instructions(code: &[u8]) -> CoreResult<Vec<Instruction>> {
    let mut r = ByteReader::new(code);
    let mut out = Vec::new();
    while !r.is_empty() {
        let offset = r.offset();
        let raw = r.read_u8()?;
        let opcode = Opcode::from_u8(raw).ok_or(CoreError::UnknownOpcode { opcode: raw, at: offset })?;
        let args = (0..opcode.arity())
            .map(|_| term::read_operand(&mut r))
            .collect::<CoreResult<Vec<_>>>()?;
        out.push(Instruction { opcode, args, offset });
        if opcode == Opcode::INT_CODE_END {
            break;
        }
    }
    Ok(out)
}

/// Decode a `Code` chunk and group its instructions per function.
///
/// Labels and line markers that directly precede a `func_info` belong to
/// the function that follows, not to the one they trail.
pub fn disassemble(chunk: &[u8], atoms: &[String]) -> CoreResult<Code> {
    let (header, stream) = parse_header(chunk)?;
    let mut functions: Vec<Function> = Vec::with_capacity((header.function_count as usize).min(stream.len()));
    let mut pending: Vec<Instruction> = Vec::new();

    for instr in decode_instructions(stream)? {
        match instr.opcode {
            Opcode::LABEL | Opcode::LINE => pending.push(instr),
            Opcode::FUNC_INFO => {
                let (name, arity) = function_identity(&instr, atoms)?;
                let mut instructions = std::mem::take(&mut pending);
                instructions.push(instr);
                functions.push(Function { name, arity, instructions });
            }
            Opcode::INT_CODE_END => break,
            _ => match functions.last_mut() {
                Some(f) => {
                    f.instructions.append(&mut pending);
                    f.instructions.push(instr);
                }
                None => {
                    return Err(CoreError::malformed(format!(
                        "{} at offset {} outside any function",
                        instr.opcode, instr.offset
                    )))
                }
            },
        }
    }
    if let Some(f) = functions.last_mut() {
        f.instructions.append(&mut pending);
    }
    trace!(functions = functions.len(), labels = header.label_count, "code disassembled");
    Ok(Code { header, functions })
}

fn function_identity(instr: &Instruction, atoms: &[String]) -> CoreResult<(String, u32)> {
    let name = instr
        .args
        .get(1)
        .and_then(Operand::as_atom)
        .and_then(|a| atom_name(atoms, a))
        .ok_or_else(|| CoreError::malformed(format!("func_info at {} has no function atom", instr.offset)))?;
    let arity = instr
        .unsigned_arg(2)
        .and_then(|a| u32::try_from(a).ok())
        .ok_or_else(|| CoreError::malformed(format!("func_info at {} has no arity", instr.offset)))?;
    Ok((name.to_owned(), arity))
}

fn atom_name(atoms: &[String], id: u32) -> Option<&str> {
    let idx = usize::try_from(id).ok()?.checked_sub(1)?;
    atoms.get(idx).map(String::as_str)
}

/* ─────────────────────────── Text rendering ─────────────────────────── */

/// Human readable listing; atom operands are shown by name.
pub fn render(module: &str, code: &Code, atoms: &[String]) -> String {
    let mut out = String::new();
    let h = &code.header;
    let _ = writeln!(
        out,
        "== {module} == (set={}, opcode_max={}, labels={}, functions={})",
        h.instruction_set, h.opcode_max, h.label_count, h.function_count
    );
    for f in &code.functions {
        let _ = writeln!(out);
        let _ = writeln!(out, ";; {}/{}", f.name, f.arity);
        for instr in &f.instructions {
            let _ = write!(out, "{:06} | {}", instr.offset, instr.opcode);
            for (i, arg) in instr.args.iter().enumerate() {
                let sep = if i == 0 { " " } else { ", " };
                match arg {
                    Operand::Atom(a) => match atom_name(atoms, *a) {
                        Some(name) => {
                            let _ = write!(out, "{sep}'{name}'");
                        }
                        None => {
                            let _ = write!(out, "{sep}{arg}");
                        }
                    },
                    _ => {
                        let _ = write!(out, "{sep}{arg}");
                    }
                }
            }
            let _ = writeln!(out);
        }
    }
    out
}
