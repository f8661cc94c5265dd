//! Pack : entrées `(source, rôle)` → un conteneur `.avm`.
//!
//! Tout est assemblé en mémoire ; la destination n'est écrite qu'une fois
//! l'assemblage complet réussi. La première entrée en échec (dans l'ordre
//! donné) interrompt l'opération et est nommée dans l'erreur.

use std::{collections::HashMap, collections::HashSet, io};

use beampack_avm::{extract_body, ContainerWriter, Role};
use beampack_core::module::{repackage, RepackOptions};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::{config::ProjectConfig, write_bytes_atomic, Error, Result};

/* ------------------------------------------------------------------------- */
/* Entrées                                                                   */
/* ------------------------------------------------------------------------- */

/// Origine d'une entrée.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// Module compilé, minimisé avant ajout.
    Module(Utf8PathBuf),
    /// Conteneur déjà construit, épissé tel quel.
    Container(Utf8PathBuf),
    /// Fichier brut enregistré sous `name`.
    File {
        /// Fichier lu.
        path: Utf8PathBuf,
        /// Nom du record.
        name: String,
    },
}

impl Source {
    /// Chemin lu.
    pub fn path(&self) -> &Utf8Path {
        match self {
            Self::Module(p) | Self::Container(p) | Self::File { path: p, .. } => p,
        }
    }
}

/// Une entrée de pack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    /// Origine.
    pub source: Source,
    /// Rôle du record (ignoré pour un conteneur épissé).
    pub role: Role,
}

impl Entry {
    /// Module compilé.
    pub fn module(path: impl Into<Utf8PathBuf>, role: Role) -> Self {
        Self { source: Source::Module(path.into()), role }
    }

    /// Conteneur imbriqué.
    pub fn container(path: impl Into<Utf8PathBuf>) -> Self {
        Self { source: Source::Container(path.into()), role: Role::Continuation }
    }

    /// Fichier brut.
    pub fn file(path: impl Into<Utf8PathBuf>, name: impl Into<String>, role: Role) -> Self {
        Self { source: Source::File { path: path.into(), name: name.into() }, role }
    }
}

/* ------------------------------------------------------------------------- */
/* Lecteurs                                                                  */
/* ------------------------------------------------------------------------- */

/// Fournit les octets d'une entrée.
pub trait SourceReader: Send + Sync {
    /// Octets du fichier `path`.
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>>;
}

/// Lecteur disque.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsReader;

impl SourceReader for FsReader {
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>> {
        crate::read_bytes(path)
    }
}

/// Lecteur mémoire (tests, systèmes de build qui gardent les artefacts).
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    files: HashMap<Utf8PathBuf, Vec<u8>>,
}

impl MemoryReader {
    /// Lecteur vide.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre un fichier.
    pub fn insert(&mut self, path: impl Into<Utf8PathBuf>, bytes: Vec<u8>) -> &mut Self {
        self.files.insert(path.into(), bytes);
        self
    }
}

impl SourceReader for MemoryReader {
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("`{path}` not registered")))
    }
}

/* ------------------------------------------------------------------------- */
/* Options / résumé                                                          */
/* ------------------------------------------------------------------------- */

/// Options de pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackOptions {
    /// Repackaging appliqué à chaque module.
    pub repack: RepackOptions,
}

impl PackOptions {
    /// Options tirées de `beampack.toml`.
    pub fn from_config(cfg: &ProjectConfig) -> Self {
        Self { repack: cfg.repack_options() }
    }
}

/// Ce qui a été écrit (utile pour logs/JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PackSummary {
    /// Records écrits, épissures comprises, record de fin exclu.
    pub records: usize,
    /// Taille totale du conteneur.
    pub bytes: usize,
    /// Modules ajoutés, dans l'ordre.
    pub modules: Vec<String>,
    /// Conteneurs épissés.
    pub spliced: usize,
    /// Entrées ignorées car déjà vues.
    pub duplicates: usize,
}

/* ------------------------------------------------------------------------- */
/* Assemblage                                                                */
/* ------------------------------------------------------------------------- */

/// Garde la première occurrence de chaque `(source, rôle)`.
pub fn dedup_entries(entries: &[Entry]) -> Vec<&Entry> {
    let mut seen = HashSet::with_capacity(entries.len());
    entries.iter().filter(|e| seen.insert(*e)).collect()
}

enum Prepared {
    Module { name: String, blob: Vec<u8> },
    File { name: String, data: Vec<u8> },
    Splice(Vec<u8>),
}

fn read_entry<R: SourceReader + ?Sized>(reader: &R, path: &Utf8Path) -> Result<Vec<u8>> {
    reader.read(path).map_err(|source| Error::ModuleRead { path: path.to_owned(), source })
}

fn prepare<R: SourceReader + ?Sized>(entry: &Entry, reader: &R, opts: &PackOptions) -> Result<Prepared> {
    let path = entry.source.path();
    let bytes = read_entry(reader, path)?;
    Ok(match &entry.source {
        Source::Module(_) => {
            let out = repackage(&bytes, &opts.repack).map_err(|source| Error::Module { path: path.to_owned(), source })?;
            Prepared::Module { name: out.name, blob: out.bytes }
        }
        Source::Container(_) => {
            let body = extract_body(&bytes).map_err(|source| Error::Container { path: path.to_owned(), source })?;
            Prepared::Splice(body.to_vec())
        }
        Source::File { name, .. } => Prepared::File { name: name.clone(), data: bytes },
    })
}

#[cfg(feature = "parallel")]
fn prepare_all<R: SourceReader + ?Sized>(entries: &[&Entry], reader: &R, opts: &PackOptions) -> Vec<Result<Prepared>> {
    use rayon::prelude::*;
    entries.par_iter().map(|e| prepare(e, reader, opts)).collect()
}

#[cfg(not(feature = "parallel"))]
fn prepare_all<R: SourceReader + ?Sized>(entries: &[&Entry], reader: &R, opts: &PackOptions) -> Vec<Result<Prepared>> {
    let mut out = Vec::with_capacity(entries.len());
    for e in entries {
        let prepared = prepare(e, reader, opts);
        let failed = prepared.is_err();
        out.push(prepared);
        if failed {
            break;
        }
    }
    out
}

/// Assemble le conteneur en mémoire.
pub fn pack_bytes<R: SourceReader + ?Sized>(
    entries: &[Entry],
    reader: &R,
    opts: &PackOptions,
) -> Result<(Vec<u8>, PackSummary)> {
    if let Some(e) = entries.iter().find(|e| e.role == Role::End) {
        return Err(Error::EndRoleEntry { path: e.source.path().to_owned() });
    }
    let unique = dedup_entries(entries);
    let starts = unique.iter().filter(|e| e.role == Role::Start).count();
    if starts > 1 {
        return Err(Error::MultipleStartEntries { count: starts });
    }

    let mut summary = PackSummary { duplicates: entries.len() - unique.len(), ..PackSummary::default() };
    let mut writer = ContainerWriter::new();
    for (entry, prepared) in unique.iter().zip(prepare_all(&unique, reader, opts)) {
        let path = entry.source.path();
        let record_err = |source| Error::Container { path: path.to_owned(), source };
        match prepared? {
            Prepared::Module { name, blob } => {
                writer.module(&name, &blob, entry.role).map_err(record_err)?;
                debug!(module = %name, path = %path, role = %entry.role, bytes = blob.len(), "module added");
                summary.modules.push(name);
            }
            Prepared::File { name, data } => {
                writer.file(&name, &data, entry.role).map_err(record_err)?;
                debug!(name = %name, path = %path, bytes = data.len(), "file added");
            }
            Prepared::Splice(body) => {
                writer.splice(&body).map_err(record_err)?;
                debug!(path = %path, bytes = body.len(), "container spliced");
                summary.spliced += 1;
            }
        }
    }
    summary.records = writer.records();
    let bytes = writer.finish().map_err(|source| Error::Container { path: Utf8PathBuf::from("<end>"), source })?;
    summary.bytes = bytes.len();
    Ok((bytes, summary))
}

/// Assemble puis écrit `dest` atomiquement.
pub fn pack(entries: &[Entry], dest: &Utf8Path, opts: &PackOptions) -> Result<PackSummary> {
    pack_with(entries, &FsReader, dest, opts)
}

/// [`pack`] avec un lecteur fourni.
pub fn pack_with<R: SourceReader + ?Sized>(
    entries: &[Entry],
    reader: &R,
    dest: &Utf8Path,
    opts: &PackOptions,
) -> Result<PackSummary> {
    let (bytes, summary) = pack_bytes(entries, reader, opts)?;
    write_bytes_atomic(dest, &bytes).map_err(|source| Error::Write { path: dest.to_owned(), source })?;
    info!(dest = %dest, records = summary.records, bytes = summary.bytes, "container written");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use beampack_avm::Container;
    use beampack_core::{
        asm::{ModuleBuilder, Operand},
        bytecode::Opcode,
        chunk, ChunkTag, CoreError,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    fn module(name: &str, with_literals: bool) -> Vec<u8> {
        let mut b = ModuleBuilder::new(name);
        let print = b.import("io", "format", 1);
        b.function("start", 0, true, &[
            (Opcode::CALL_EXT_ONLY, vec![Operand::Unsigned(1), Operand::Unsigned(print.into())]),
        ]);
        if with_literals {
            b.literals(b"\0\0\0\0".to_vec(), true);
        }
        b.chunk(ChunkTag(*b"Dbgi"), vec![7; 33]);
        b.build()
    }

    fn reader() -> MemoryReader {
        let mut r = MemoryReader::new();
        r.insert("ebin/app.beam", module("app", true));
        r.insert("ebin/util.beam", module("util", false));
        r.insert("priv/motd.txt", b"hello".to_vec());
        r
    }

    fn dep_container() -> Vec<u8> {
        let mut w = ContainerWriter::new();
        w.module("dep", &module("dep", false), Role::Continuation).unwrap();
        w.file("dep/data", b"123", Role::Continuation).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn module_file_and_nested_container() -> Result<()> {
        let mut r = reader();
        r.insert("deps/dep.avm", dep_container());
        let entries = [
            Entry::module("ebin/app.beam", Role::Start),
            Entry::file("priv/motd.txt", "motd.txt", Role::Continuation),
            Entry::container("deps/dep.avm"),
        ];
        let (bytes, summary) = pack_bytes(&entries, &r, &PackOptions::default())?;
        let c = Container::parse(&bytes).unwrap();

        let names: Vec<_> = c.records.iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["app.beam", "motd.txt", "dep.beam", "dep/data"]);
        assert_eq!(summary.records, 4);
        assert_eq!(summary.modules, vec!["app".to_string()]);
        assert_eq!(summary.spliced, 1);
        assert_eq!(summary.bytes, bytes.len());
        assert_eq!(c.records[0].role(), Some(Role::Start));
        assert_eq!(c.records[1].file_data(), Some(&b"hello"[..]));

        // module payload was minimized
        let app = chunk::decode(c.records[0].payload).unwrap();
        assert!(app.contains_key(&ChunkTag::LITU));
        assert!(!app.contains_key(&ChunkTag(*b"Dbgi")));
        Ok(())
    }

    #[test]
    fn reference_module_is_minimized_and_readable() -> Result<()> {
        let source = include_bytes!("../../beampack-core/tests/data/hello.beam");
        let mut r = MemoryReader::new();
        r.insert("ebin/hello.beam", source.to_vec());
        let (bytes, summary) = pack_bytes(&[Entry::module("ebin/hello.beam", Role::Start)], &r, &PackOptions::default())?;
        assert_eq!(summary.modules, vec!["hello".to_string()]);

        let c = Container::parse(&bytes).unwrap();
        assert_eq!(c.records[0].name, "hello.beam");
        assert!(c.records[0].payload.len() < source.len());
        let m = beampack_core::module::BeamModule::parse(c.records[0].payload).unwrap();
        assert_eq!(m.code.functions.len(), 5);
        Ok(())
    }

    #[test]
    fn module_without_literals_packs() -> Result<()> {
        let (bytes, summary) = pack_bytes(&[Entry::module("ebin/util.beam", Role::Start)], &reader(), &PackOptions::default())?;
        assert_eq!(summary.modules, vec!["util".to_string()]);
        let c = Container::parse(&bytes).unwrap();
        assert!(!chunk::decode(c.records[0].payload).unwrap().contains_key(&ChunkTag::LITU));
        Ok(())
    }

    #[test]
    fn duplicates_are_dropped_keeping_first() -> Result<()> {
        let entries = [
            Entry::module("ebin/app.beam", Role::Start),
            Entry::module("ebin/util.beam", Role::Continuation),
            Entry::module("ebin/app.beam", Role::Start),
            Entry::module("ebin/util.beam", Role::Continuation),
        ];
        let (_, summary) = pack_bytes(&entries, &reader(), &PackOptions::default())?;
        assert_eq!(summary.modules, vec!["app".to_string(), "util".into()]);
        assert_eq!(summary.duplicates, 2);
        Ok(())
    }

    #[test]
    fn at_most_one_start() {
        let entries = [Entry::module("ebin/app.beam", Role::Start), Entry::module("ebin/util.beam", Role::Start)];
        assert!(matches!(
            pack_bytes(&entries, &reader(), &PackOptions::default()),
            Err(Error::MultipleStartEntries { count: 2 })
        ));
    }

    #[test]
    fn end_role_entries_are_rejected() {
        for entry in [
            Entry::module("ebin/app.beam", Role::End),
            Entry::file("priv/motd.txt", "motd.txt", Role::End),
            Entry { source: Source::Container("deps/dep.avm".into()), role: Role::End },
        ] {
            let path = entry.source.path().to_owned();
            let err = pack_bytes(&[Entry::module("ebin/util.beam", Role::Start), entry], &reader(), &PackOptions::default())
                .unwrap_err();
            assert!(matches!(&err, Error::EndRoleEntry { path: p } if *p == path), "{err}");
        }
    }

    #[test]
    fn library_container_without_start() -> Result<()> {
        let (bytes, _) = pack_bytes(&[Entry::module("ebin/util.beam", Role::Continuation)], &reader(), &PackOptions::default())?;
        assert!(Container::parse(&bytes).unwrap().records.iter().all(|r| r.role() == Some(Role::Continuation)));
        Ok(())
    }

    #[test]
    fn failures_name_the_entry() {
        let mut r = reader();
        r.insert("ebin/bad.beam", b"not a module".to_vec());
        r.insert("deps/bad.avm", b"#!/bin/sh\n".to_vec());
        let opts = PackOptions::default();

        let err = pack_bytes(&[Entry::module("ebin/missing.beam", Role::Start)], &r, &opts).unwrap_err();
        assert!(matches!(&err, Error::ModuleRead { path, .. } if path == "ebin/missing.beam"));

        let err = pack_bytes(&[Entry::module("ebin/bad.beam", Role::Start)], &r, &opts).unwrap_err();
        assert!(matches!(&err, Error::Module { source: CoreError::MalformedContainer(_), .. }));
        assert!(err.to_string().contains("ebin/bad.beam"));

        let err = pack_bytes(&[Entry::container("deps/bad.avm")], &r, &opts).unwrap_err();
        assert!(matches!(&err, Error::Container { source: beampack_avm::AvmError::BadMagicHeader, .. }));

        // first failing entry wins
        let entries = [Entry::module("ebin/app.beam", Role::Start), Entry::module("ebin/bad.beam", Role::Continuation), Entry::container("deps/bad.avm")];
        assert!(matches!(pack_bytes(&entries, &r, &opts), Err(Error::Module { .. })));
    }

    #[test]
    fn pack_writes_only_on_success() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let dest = dir.join("out.avm");
        let r = reader();

        let summary = pack_with(&[Entry::module("ebin/app.beam", Role::Start)], &r, &dest, &PackOptions::default())?;
        let first = std::fs::read(&dest)?;
        assert_eq!(first.len(), summary.bytes);

        let failed = pack_with(&[Entry::module("ebin/missing.beam", Role::Start)], &r, &dest, &PackOptions::default());
        assert!(failed.is_err());
        assert_eq!(std::fs::read(&dest)?, first);
        Ok(())
    }

    #[test]
    fn line_chunk_follows_options() -> Result<()> {
        let mut b = ModuleBuilder::new("lined");
        b.function("f", 0, true, &[(Opcode::RETURN, vec![])]);
        b.chunk(ChunkTag::LINE, vec![0; 24]);
        let mut r = MemoryReader::new();
        r.insert("lined.beam", b.build());

        let lines = PackOptions { repack: RepackOptions { include_lines: true } };
        for (opts, expected) in [(PackOptions::default(), false), (lines, true)] {
            let (bytes, _) = pack_bytes(&[Entry::module("lined.beam", Role::Start)], &r, &opts)?;
            let c = Container::parse(&bytes).unwrap();
            assert_eq!(chunk::decode(c.records[0].payload).unwrap().contains_key(&ChunkTag::LINE), expected);
        }
        Ok(())
    }
}
