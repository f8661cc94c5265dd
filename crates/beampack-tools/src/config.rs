//! Configuration projet (`beampack.toml`).
//!
//! ```toml
//! [pack]
//! include_lines = false
//! deps_dir = "_build/deps"
//!
//! [verify]
//! allowlist = "allowlist.json"
//! ```
//!
//! Les chemins relatifs sont résolus depuis le dossier du fichier.

use std::fs;

use beampack_core::module::RepackOptions;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// Nom du fichier recherché.
pub const CONFIG_FILE: &str = "beampack.toml";

/// Section `[pack]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackSection {
    /// Garder le chunk `Line`.
    pub include_lines: bool,
    /// Dossier des artefacts de dépendances déjà construits.
    pub deps_dir: Option<Utf8PathBuf>,
}

/// Section `[verify]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifySection {
    /// Allow-list JSON ; la liste intégrée sinon.
    pub allowlist: Option<Utf8PathBuf>,
}

/// Configuration complète.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// `[pack]`.
    pub pack: PackSection,
    /// `[verify]`.
    pub verify: VerifySection,
    /// Dossier du fichier lu (`None` pour les valeurs par défaut).
    #[serde(skip)]
    pub root: Option<Utf8PathBuf>,
}

impl ProjectConfig {
    /// Parse un contenu TOML.
    pub fn from_toml(text: &str, origin: &Utf8Path) -> Result<Self> {
        let mut cfg: Self =
            toml::from_str(text).map_err(|e| Error::Config { path: origin.to_owned(), reason: e.to_string() })?;
        cfg.root = origin.parent().map(Utf8Path::to_path_buf);
        Ok(cfg)
    }

    /// Résout un chemin relatif au dossier de config.
    pub fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Dossier des dépendances, résolu.
    pub fn deps_dir(&self) -> Option<Utf8PathBuf> {
        self.pack.deps_dir.as_deref().map(|p| self.resolve(p))
    }

    /// Allow-list configurée, résolue.
    pub fn allowlist(&self) -> Option<Utf8PathBuf> {
        self.verify.allowlist.as_deref().map(|p| self.resolve(p))
    }

    /// Options de repackaging dérivées.
    pub fn repack_options(&self) -> RepackOptions {
        RepackOptions { include_lines: self.pack.include_lines }
    }
}

/// Charge `beampack.toml` : chemin explicite, sinon recherche ascendante
/// depuis `start`, sinon valeurs par défaut.
pub fn load_config(explicit: Option<&Utf8Path>, start: &Utf8Path) -> Result<ProjectConfig> {
    if let Some(p) = explicit {
        return read_config(p);
    }
    let mut cur = Some(start);
    while let Some(dir) = cur {
        let cand = dir.join(CONFIG_FILE);
        if cand.is_file() {
            return read_config(&cand);
        }
        cur = dir.parent();
    }
    debug!(start = %start, "no {CONFIG_FILE} found, using defaults");
    Ok(ProjectConfig::default())
}

fn read_config(path: &Utf8Path) -> Result<ProjectConfig> {
    let text = fs::read_to_string(path).map_err(|e| Error::Config { path: path.to_owned(), reason: e.to_string() })?;
    let cfg = ProjectConfig::from_toml(&text, path)?;
    debug!(path = %path, "config loaded");
    Ok(cfg)
}
