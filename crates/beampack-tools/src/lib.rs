//! beampack-tools: orchestration fichier des opérations pack / verify.
//!
//! Objectifs : lire les entrées, dédupliquer, assembler en mémoire, écrire
//! atomiquement ; charger allow-list et config ; vérifier un ensemble de
//! modules avec leurs dépendances.
//!
//! ## Modules & zones clés
//! - `prelude`   : import rapide des types/fns usuels
//! - I/O         : `read_bytes`, `write_bytes_atomic`
//! - Logs        : `init_tracing`
//! - [`pack`]    : `Source`, `Entry`, `SourceReader`, `pack`, `pack_bytes`
//! - [`deps`]    : artefacts de dépendances, `PackPlan`
//! - [`check`]   : `verify_modules`
//! - [`allowlist`], [`config`]
//!
//! Aucune ligne de commande ici : les fonctions sont appelées par le système
//! de build hôte.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
};

use camino::{Utf8Path, Utf8PathBuf};
use tracing_subscriber::EnvFilter;

pub mod allowlist;
pub mod check;
pub mod config;
pub mod deps;
mod error;
pub mod pack;

pub use error::{Error, Result};

/// Version lisible du crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/* ------------------------------------------------------------------------- */
/* Prelude                                                                   */
/* ------------------------------------------------------------------------- */

/// Re-exports compacts pour les intégrations.
pub mod prelude {
    pub use beampack_avm::Role;
    pub use beampack_core::verify::Report;
    pub use camino::{Utf8Path, Utf8PathBuf};

    pub use crate::{
        allowlist::AllowList,
        check::{verify_modules, verify_modules_with},
        config::{load_config, ProjectConfig},
        deps::{list_dependency_artifacts, DependencyArtifact, PackPlan},
        init_tracing,
        pack::{pack, pack_bytes, pack_with, Entry, FsReader, MemoryReader, PackOptions, PackSummary, Source, SourceReader},
        read_bytes, write_bytes_atomic, Error, Result,
    };
}

/* ------------------------------------------------------------------------- */
/* Logs                                                                      */
/* ------------------------------------------------------------------------- */

/// Installe un subscriber `fmt` filtré par `RUST_LOG` (sinon `default_filter`).
///
/// Sans effet si un subscriber global existe déjà.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

/* ------------------------------------------------------------------------- */
/* I/O utils                                                                 */
/* ------------------------------------------------------------------------- */

/// Lis un fichier binaire.
pub fn read_bytes(path: &Utf8Path) -> io::Result<Vec<u8>> {
    fs::read(path)
}

/// Écrit via un fichier temporaire voisin puis renomme : la destination
/// contient l'ancien contenu ou le nouveau, jamais un mélange.
pub fn write_bytes_atomic(path: &Utf8Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => Utf8Path::new("."),
    };
    let base = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no file name in `{path}`")))?;
    let tmp = unique_tmp_path(parent, base);
    if let Err(e) = write_tmp(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, path) {
        // Windows : rename sur cible existante peut échouer
        let fallback = fs::copy(&tmp, path).map(|_| ());
        let _ = fs::remove_file(&tmp);
        return fallback.map_err(|_| e);
    }
    Ok(())
}

fn write_tmp(tmp: &Utf8Path, bytes: &[u8]) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(tmp)?);
    w.write_all(bytes)?;
    w.flush()?;
    w.get_ref().sync_all()
}

fn unique_tmp_path(dir: &Utf8Path, base: &str) -> Utf8PathBuf {
    let mut i = 0u32;
    loop {
        let candidate = dir.join(format!(".{base}.tmp{i}"));
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}
