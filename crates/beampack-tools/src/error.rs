//! Erreurs de l'orchestration ; chaque variante nomme l'entrée fautive.

use std::io;

use beampack_avm::AvmError;
use beampack_core::CoreError;
use camino::Utf8PathBuf;
use thiserror::Error;

/// Erreur des opérations pack / verify.
#[derive(Debug, Error)]
pub enum Error {
    /// Source illisible (module, conteneur ou fichier brut).
    #[error("cannot read `{path}`: {source}")]
    ModuleRead {
        /// Entrée concernée.
        path: Utf8PathBuf,
        /// Erreur d'E/S.
        #[source]
        source: io::Error,
    },
    /// Module refusé par le décodeur ou le repackager.
    #[error("module `{path}`: {source}")]
    Module {
        /// Entrée concernée.
        path: Utf8PathBuf,
        /// Cause.
        #[source]
        source: CoreError,
    },
    /// Conteneur imbriqué (ou record) invalide.
    #[error("container `{path}`: {source}")]
    Container {
        /// Entrée concernée.
        path: Utf8PathBuf,
        /// Cause.
        #[source]
        source: AvmError,
    },
    /// Écriture de la sortie impossible ; aucune sortie partielle ne reste.
    #[error("cannot write `{path}`: {source}")]
    Write {
        /// Destination.
        path: Utf8PathBuf,
        /// Erreur d'E/S.
        #[source]
        source: io::Error,
    },
    /// Allow-list illisible ou mal formée.
    #[error("allow-list {origin}: {reason}")]
    AllowList {
        /// Fichier ou `<builtin>`.
        origin: String,
        /// Détail.
        reason: String,
    },
    /// `beampack.toml` invalide.
    #[error("config `{path}`: {reason}")]
    Config {
        /// Fichier lu.
        path: Utf8PathBuf,
        /// Détail.
        reason: String,
    },
    /// Plus d'une entrée de premier niveau marquée `start`.
    #[error("{count} entries are marked as start, at most one is allowed")]
    MultipleStartEntries {
        /// Nombre d'entrées `start`.
        count: usize,
    },
    /// Entrée marquée `end` : ce rôle est réservé au record terminal.
    #[error("entry `{path}` has the end role, which only the terminating record may carry")]
    EndRoleEntry {
        /// Entrée concernée.
        path: Utf8PathBuf,
    },
    /// E/S diverse (parcours de répertoires).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Alias résultat du crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
