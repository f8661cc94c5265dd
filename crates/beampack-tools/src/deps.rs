//! Artefacts de dépendances déjà construits + plan de pack d'un projet.
//!
//! Un dossier de dépendances contient des modules `.beam` et des conteneurs
//! `.avm` ; tout autre fichier est ignoré. L'ordre est celui des chemins
//! triés, pour un pack reproductible.

use beampack_avm::Role;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::{pack::Entry, Error, Result};

/// Un artefact trouvé dans le dossier de dépendances.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyArtifact {
    /// Module compilé.
    Module(Utf8PathBuf),
    /// Conteneur déjà packé.
    Container(Utf8PathBuf),
}

impl DependencyArtifact {
    /// Classe un chemin selon son extension.
    pub fn from_path(path: &Utf8Path) -> Option<Self> {
        match path.extension()? {
            "beam" => Some(Self::Module(path.to_path_buf())),
            "avm" => Some(Self::Container(path.to_path_buf())),
            _ => None,
        }
    }

    /// Chemin de l'artefact.
    pub fn path(&self) -> &Utf8Path {
        match self {
            Self::Module(p) | Self::Container(p) => p,
        }
    }

    /// Entrée de pack correspondante (toujours en continuation).
    pub fn entry(&self) -> Entry {
        match self {
            Self::Module(p) => Entry::module(p.clone(), Role::Continuation),
            Self::Container(p) => Entry::container(p.clone()),
        }
    }
}

/// Liste récursive et triée des artefacts sous `dir`.
///
/// Un dossier absent donne une liste vide.
pub fn list_dependency_artifacts(dir: &Utf8Path) -> Result<Vec<DependencyArtifact>> {
    if !dir.exists() {
        debug!(dir = %dir, "no dependency directory");
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = Utf8Path::from_path(entry.path()) else {
            trace!(path = %entry.path().display(), "skipping non UTF-8 path");
            continue;
        };
        if let Some(artifact) = DependencyArtifact::from_path(path) {
            found.push(artifact);
        }
    }
    debug!(dir = %dir, artifacts = found.len(), "dependency artifacts listed");
    Ok(found)
}

/// Plan de pack d'une application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackPlan {
    /// Module de démarrage, s'il y en a un (sinon conteneur bibliothèque).
    pub entry: Option<Utf8PathBuf>,
    /// Autres modules du projet.
    pub modules: Vec<Utf8PathBuf>,
    /// Fichiers brut `(chemin, nom du record)`.
    pub files: Vec<(Utf8PathBuf, String)>,
    /// Artefacts de dépendances.
    pub dependencies: Vec<DependencyArtifact>,
}

impl PackPlan {
    /// Plan avec les dépendances listées depuis `deps_dir`.
    pub fn with_deps_dir(mut self, deps_dir: &Utf8Path) -> Result<Self> {
        self.dependencies = list_dependency_artifacts(deps_dir)?;
        Ok(self)
    }

    /// Entrées ordonnées : démarrage, modules, fichiers, dépendances.
    pub fn entries(&self) -> Vec<Entry> {
        let mut out = Vec::with_capacity(1 + self.modules.len() + self.files.len() + self.dependencies.len());
        out.extend(self.entry.iter().map(|p| Entry::module(p.clone(), Role::Start)));
        out.extend(self.modules.iter().map(|p| Entry::module(p.clone(), Role::Continuation)));
        out.extend(self.files.iter().map(|(p, name)| Entry::file(p.clone(), name.clone(), Role::Continuation)));
        out.extend(self.dependencies.iter().map(DependencyArtifact::entry));
        out
    }
}
