//! Module tables (atoms, imports, exports) and the minimizing repackager.

use std::{fs, path::Path};

use tracing::debug;

use crate::{
    bytecode::{self, term, Code},
    chunk::{self, ChunkMap},
    literals, ByteReader, ChunkTag, CoreError, CoreResult,
};

/// Atom index (1-based, 0 is reserved for `[]`).
pub type AtomId = u32;
/// Function arity.
pub type Arity = u32;

/// Chunks kept by [`repackage`]; everything else is debug or tooling metadata.
pub const RUNTIME_CHUNKS: &[ChunkTag] = &[
    ChunkTag::ATU8,
    ChunkTag::ATOM,
    ChunkTag::CODE,
    ChunkTag::EXPT,
    ChunkTag::LOCT,
    ChunkTag::IMPT,
    ChunkTag::LITU,
    ChunkTag::FUNT,
    ChunkTag::STRT,
];

/// One `ImpT` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Import {
    /// Owner module atom.
    pub module: AtomId,
    /// Function name atom.
    pub function: AtomId,
    /// Arity.
    pub arity: Arity,
}

/// One `ExpT` / `LocT` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Export {
    /// Function name atom.
    pub function: AtomId,
    /// Arity.
    pub arity: Arity,
    /// Entry label.
    pub label: u32,
}

/* ─────────────────────────── Table decoding ─────────────────────────── */

/// Decode an atom table. `utf8` selects `AtU8` vs. legacy latin-1 `Atom`.
///
/// A negative count marks the newer layout where each length is a
/// compact-term encoded unsigned instead of a single byte.
pub fn decode_atoms(chunk: &[u8], utf8: bool) -> CoreResult<Vec<String>> {
    let mut r = ByteReader::new(chunk);
    let raw_count = r.read_i32_be().map_err(|_| CoreError::malformed("truncated atom table"))?;
    let long_lengths = raw_count < 0;
    let count = raw_count.unsigned_abs() as usize;

    let mut atoms = Vec::with_capacity(count.min(chunk.len()));
    for i in 0..count {
        let len = if long_lengths {
            usize::try_from(term::read_unsigned(&mut r)?)
                .map_err(|_| CoreError::malformed("atom length overflow"))?
        } else {
            r.read_u8()? as usize
        };
        let bytes = r
            .read_bytes(len)
            .map_err(|_| CoreError::malformed(format!("atom {} truncated", i + 1)))?;
        let atom = if utf8 {
            std::str::from_utf8(bytes).map_err(|_| CoreError::InvalidUtf8("atom table"))?.to_owned()
        } else {
            bytes.iter().map(|&b| char::from(b)).collect()
        };
        atoms.push(atom);
    }
    Ok(atoms)
}

/// Decode an `ImpT` chunk.
pub fn decode_imports(chunk: &[u8]) -> CoreResult<Vec<Import>> {
    decode_triples(chunk, "import table")?
        .into_iter()
        .map(|[module, function, arity]| Ok(Import { module, function, arity }))
        .collect()
}

/// Decode an `ExpT` or `LocT` chunk.
pub fn decode_exports(chunk: &[u8]) -> CoreResult<Vec<Export>> {
    decode_triples(chunk, "export table")?
        .into_iter()
        .map(|[function, arity, label]| Ok(Export { function, arity, label }))
        .collect()
}

fn decode_triples(chunk: &[u8], what: &'static str) -> CoreResult<Vec<[u32; 3]>> {
    let mut r = ByteReader::new(chunk);
    let count = r.read_u32_be().map_err(|_| CoreError::malformed(format!("truncated {what}")))? as usize;
    if r.remaining() < count.saturating_mul(12) {
        return Err(CoreError::malformed(format!("{what} declares {count} entries, {} bytes left", r.remaining())));
    }
    (0..count)
        .map(|_| Ok([r.read_u32_be()?, r.read_u32_be()?, r.read_u32_be()?]))
        .collect()
}

/// Atom table of a decoded module, whichever encoding it uses.
pub fn atom_table(chunks: &ChunkMap) -> CoreResult<Vec<String>> {
    if let Some(data) = chunks.get(&ChunkTag::ATU8) {
        decode_atoms(data, true)
    } else if let Some(data) = chunks.get(&ChunkTag::ATOM) {
        decode_atoms(data, false)
    } else {
        Err(CoreError::malformed("module has no atom table"))
    }
}

/// Declared module name (first atom).
pub fn module_name(chunks: &ChunkMap) -> CoreResult<String> {
    atom_table(chunks)?
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::malformed("atom table is empty"))
}

/* ─────────────────────────── Parsed module ─────────────────────────── */

/// A compiled module with its resolved tables and disassembled code.
#[derive(Debug, Clone)]
pub struct BeamModule {
    /// Module name (first atom).
    pub name: String,
    /// Atom table; `atoms[0]` is atom 1.
    pub atoms: Vec<String>,
    /// External function references.
    pub imports: Vec<Import>,
    /// Exported functions.
    pub exports: Vec<Export>,
    /// Disassembled code.
    pub code: Code,
    /// Where the module was read from (diagnostics only).
    pub source: Option<String>,
}

impl BeamModule {
    /// Parse module bytes (chunks, tables and code).
    pub fn parse(bytes: &[u8]) -> CoreResult<Self> {
        Self::from_chunks(&chunk::decode(bytes)?)
    }

    /// Build from already decoded chunks.
    pub fn from_chunks(chunks: &ChunkMap) -> CoreResult<Self> {
        let atoms = atom_table(chunks)?;
        let name = atoms.first().cloned().ok_or_else(|| CoreError::malformed("atom table is empty"))?;
        let imports = chunks.get(&ChunkTag::IMPT).map(|d| decode_imports(d)).transpose()?.unwrap_or_default();
        let exports = chunks.get(&ChunkTag::EXPT).map(|d| decode_exports(d)).transpose()?.unwrap_or_default();
        let code_chunk = chunks.get(&ChunkTag::CODE).ok_or_else(|| CoreError::malformed("module has no Code chunk"))?;
        let code = bytecode::disassemble(code_chunk, &atoms)?;
        let module = Self { name, atoms, imports, exports, code, source: None };
        module.check_references()?;
        Ok(module)
    }

    // Every table row names known atoms; every call goes through a known import.
    fn check_references(&self) -> CoreResult<()> {
        if let Some(i) = (0..self.imports.len()).find(|&i| self.import(i).is_none()) {
            return Err(CoreError::malformed(format!("import {i} refers to an unknown atom")));
        }
        if let Some(e) = self.exports.iter().find(|e| self.atom(e.function).is_none()) {
            return Err(CoreError::malformed(format!("export of atom {} refers to an unknown atom", e.function)));
        }
        for instr in self.code.instructions() {
            let Some(index) = instr.import_index() else { continue };
            if usize::try_from(index).map_or(true, |i| i >= self.imports.len()) {
                return Err(CoreError::malformed(format!(
                    "{} at offset {} uses import {index}, table has {}",
                    instr.opcode,
                    instr.offset,
                    self.imports.len()
                )));
            }
        }
        Ok(())
    }

    /// Attach a source hint used in diagnostics.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Resolve an atom index (1-based).
    pub fn atom(&self, id: AtomId) -> Option<&str> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.atoms.get(idx).map(String::as_str)
    }

    /// Resolve an import index to `(module, function, arity)`.
    pub fn import(&self, index: usize) -> Option<(&str, &str, Arity)> {
        let imp = self.imports.get(index)?;
        Some((self.atom(imp.module)?, self.atom(imp.function)?, imp.arity))
    }

    /// Exported `(function, arity)` pairs.
    pub fn exported(&self) -> impl Iterator<Item = (&str, Arity)> + '_ {
        self.exports.iter().filter_map(|e| Some((self.atom(e.function)?, e.arity)))
    }
}

/* ─────────────────────────── Repackaging ─────────────────────────── */

/// Options for [`repackage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepackOptions {
    /// Keep the `Line` chunk so the runtime can report source lines.
    pub include_lines: bool,
}

impl RepackOptions {
    /// Chunk tags kept under these options.
    pub fn allowed_tags(&self) -> Vec<ChunkTag> {
        let mut tags = RUNTIME_CHUNKS.to_vec();
        if self.include_lines {
            tags.push(ChunkTag::LINE);
        }
        tags
    }
}

/// Result of [`repackage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repackaged {
    /// Declared module name.
    pub name: String,
    /// Minimized module blob.
    pub bytes: Vec<u8>,
    /// Tags removed by the filter, in file order.
    pub dropped: Vec<ChunkTag>,
}

/// Turn one compiled module into a minimized, runtime-loadable blob.
pub fn repackage(bytes: &[u8], opts: &RepackOptions) -> CoreResult<Repackaged> {
    let mut chunks = chunk::decode(bytes)?;
    literals::normalize_literals(&mut chunks)?;
    let dropped = chunk::retain_tags(&mut chunks, &opts.allowed_tags());
    if !chunks.contains_key(&ChunkTag::CODE) {
        return Err(CoreError::malformed("module has no Code chunk"));
    }
    let name = module_name(&chunks)?;
    let out = chunk::encode(&chunks);
    debug!(module = %name, before = bytes.len(), after = out.len(), dropped = ?dropped, "module repackaged");
    Ok(Repackaged { name, bytes: out, dropped })
}

/// [`repackage`] reading the module from disk.
pub fn repackage_file(path: &Path, opts: &RepackOptions) -> CoreResult<Repackaged> {
    let bytes = fs::read(path).map_err(|source| CoreError::ModuleRead { path: path.display().to_string(), source })?;
    repackage(&bytes, opts)
}
