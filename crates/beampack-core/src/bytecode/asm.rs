//! Tiny assembler producing well-formed module blobs.
//!
//! Used to build fixtures for the decoder, the repackager and the verifier
//! alongside the reference module in `tests/data`. Only built with
//! the `fixtures` feature (dev-dependents enable it):
//!
//! ```ignore
//! use beampack_core::asm::{ModuleBuilder, Operand};
//! use beampack_core::bytecode::Opcode;
//!
//! let mut b = ModuleBuilder::new("hello");
//! let io = b.import("io", "format", 1);
//! b.function("start", 0, true, &[
//!     (Opcode::CALL_EXT_ONLY, vec![Operand::Unsigned(1), Operand::Unsigned(io.into())]),
//! ]);
//! let blob = b.build();
//! assert_eq!(&blob[..4], b"FOR1");
//! ```

use std::io::Write as _;

use flate2::{write::ZlibEncoder, Compression};

pub use super::term::Operand;
use super::{opcode::Opcode, term};
use crate::{chunk::{self, ChunkMap}, ByteWriter, ChunkTag};

const INFO_SIZE: u32 = 16;

/// Raw instruction stream writer; [`CodeAssembler::finish`] adds the header.
#[derive(Debug, Clone, Default)]
pub struct CodeAssembler {
    stream: ByteWriter,
}

impl CodeAssembler {
    /// Empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one instruction.
    pub fn emit(&mut self, op: Opcode, args: Vec<Operand>) -> &mut Self {
        self.write(op, &args);
        self
    }

    fn write(&mut self, op: Opcode, args: &[Operand]) {
        self.stream.write_u8(op.number());
        for a in args {
            term::write_operand(&mut self.stream, a);
        }
    }

    /// Full `Code` chunk payload, terminated by `int_code_end`.
    pub fn finish(mut self, label_count: u32, function_count: u32) -> Vec<u8> {
        self.write(Opcode::INT_CODE_END, &[]);
        let mut w = ByteWriter::with_capacity(20 + self.stream.len());
        w.write_u32_be(INFO_SIZE);
        w.write_u32_be(0);
        w.write_u32_be(u32::from(Opcode::MAX));
        w.write_u32_be(label_count);
        w.write_u32_be(function_count);
        w.write_bytes(self.stream.as_slice());
        w.into_vec()
    }
}

/// Builder for a complete module (atoms, imports, exports, code, literals).
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    atoms: Vec<String>,
    imports: Vec<[u32; 3]>,
    exports: Vec<[u32; 3]>,
    locals: Vec<[u32; 3]>,
    code: CodeAssembler,
    next_label: u32,
    functions: u32,
    literals: Option<Vec<u8>>,
    extra: Vec<(ChunkTag, Vec<u8>)>,
}

impl ModuleBuilder {
    /// New module; `name` becomes atom 1.
    pub fn new(name: &str) -> Self {
        Self {
            atoms: vec![name.to_owned()],
            imports: Vec::new(),
            exports: Vec::new(),
            locals: Vec::new(),
            code: CodeAssembler::new(),
            next_label: 1,
            functions: 0,
            literals: None,
            extra: Vec::new(),
        }
    }

    /// Intern an atom, returning its 1-based index.
    pub fn atom(&mut self, name: &str) -> u32 {
        let pos = match self.atoms.iter().position(|a| a == name) {
            Some(pos) => pos,
            None => {
                self.atoms.push(name.to_owned());
                self.atoms.len() - 1
            }
        };
        pos as u32 + 1
    }

    /// Intern an import, returning its 0-based index.
    pub fn import(&mut self, module: &str, function: &str, arity: u32) -> u32 {
        let entry = [self.atom(module), self.atom(function), arity];
        let pos = match self.imports.iter().position(|i| *i == entry) {
            Some(pos) => pos,
            None => {
                self.imports.push(entry);
                self.imports.len() - 1
            }
        };
        pos as u32
    }

    /// Reserve a fresh label for use inside a function body.
    pub fn label(&mut self) -> u32 {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    /// Emit `label; func_info; label; body…` and register the function.
    /// Returns the entry label.
    pub fn function(&mut self, name: &str, arity: u32, exported: bool, body: &[(Opcode, Vec<Operand>)]) -> u32 {
        let name_atom = self.atom(name);
        let info_label = self.label();
        let entry = self.label();
        self.code.write(Opcode::LABEL, &[Operand::Unsigned(info_label.into())]);
        self.code.write(Opcode::FUNC_INFO, &[Operand::Atom(1), Operand::Atom(name_atom), Operand::Unsigned(arity.into())]);
        self.code.write(Opcode::LABEL, &[Operand::Unsigned(entry.into())]);
        for (op, args) in body {
            self.code.write(*op, args);
        }
        self.functions += 1;
        let row = [name_atom, arity, entry];
        if exported {
            self.exports.push(row);
        } else {
            self.locals.push(row);
        }
        entry
    }

    /// Attach a literal table in the compiler's `LitT` layout.
    pub fn literals(&mut self, raw: Vec<u8>, compress: bool) -> &mut Self {
        let packed = compress.then(|| zlib(&raw)).flatten();
        let mut table = ByteWriter::with_capacity(4 + raw.len());
        match packed {
            Some(z) => {
                table.write_u32_be(raw.len() as u32);
                table.write_bytes(&z);
            }
            None => {
                table.write_u32_be(0);
                table.write_bytes(&raw);
            }
        }
        self.literals = Some(table.into_vec());
        self
    }

    /// Append an arbitrary chunk after the standard ones.
    pub fn chunk(&mut self, tag: ChunkTag, data: Vec<u8>) -> &mut Self {
        self.extra.push((tag, data));
        self
    }

    /// Chunks in compiler order, extras last.
    pub fn chunks(&self) -> ChunkMap {
        let mut m = ChunkMap::new();
        m.insert(ChunkTag::ATU8, encode_atoms(&self.atoms));
        m.insert(ChunkTag::CODE, self.code.clone().finish(self.next_label, self.functions));
        m.insert(ChunkTag::STRT, Vec::new());
        m.insert(ChunkTag::IMPT, encode_triples(&self.imports));
        m.insert(ChunkTag::EXPT, encode_triples(&self.exports));
        if let Some(lit) = &self.literals {
            m.insert(ChunkTag::LITT, lit.clone());
        }
        m.insert(ChunkTag::LOCT, encode_triples(&self.locals));
        for (tag, data) in &self.extra {
            m.insert(*tag, data.clone());
        }
        m
    }

    /// Encoded module blob.
    pub fn build(&self) -> Vec<u8> {
        chunk::encode(&self.chunks())
    }
}

fn zlib(raw: &[u8]) -> Option<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(raw).ok()?;
    enc.finish().ok()
}

// Atoms longer than 255 bytes switch the table to compact lengths.
fn encode_atoms(atoms: &[String]) -> Vec<u8> {
    let long = atoms.iter().any(|a| a.len() > usize::from(u8::MAX));
    let mut w = ByteWriter::new();
    let count = atoms.len() as u32;
    w.write_u32_be(if long { count.wrapping_neg() } else { count });
    for a in atoms {
        if long {
            term::write_operand(&mut w, &Operand::Unsigned(a.len() as u64));
        } else {
            w.write_u8(a.len() as u8);
        }
        w.write_bytes(a.as_bytes());
    }
    w.into_vec()
}

fn encode_triples(rows: &[[u32; 3]]) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(4 + rows.len() * 12);
    w.write_u32_be(rows.len() as u32);
    for row in rows {
        for v in row {
            w.write_u32_be(*v);
        }
    }
    w.into_vec()
}
