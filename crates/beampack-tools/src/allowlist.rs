//! Allow-list de référence du runtime cible (opcodes + appels externes).
//!
//! ```json
//! { "target": "atomvm", "version": "0.6",
//!   "opcodes": ["label", "move", ...],
//!   "calls": ["erlang:self/0", "lists:reverse/1", ...] }
//! ```
//!
//! Chargée une fois par vérification puis passée par référence.

use std::{collections::BTreeSet, fs};

use beampack_core::verify::{AllowedCalls, ExternalCall};
use camino::Utf8Path;
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

const BUILTIN: &str = include_str!("../data/allowlist.json");

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAllowList {
    target: String,
    version: String,
    opcodes: Vec<String>,
    calls: Vec<String>,
}

/// Allow-list immuable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    /// Runtime visé.
    pub target: String,
    /// Version du runtime visé.
    pub version: String,
    /// Mnémoniques autorisées.
    pub opcodes: BTreeSet<String>,
    /// Appels `module:function/arity` autorisés.
    pub calls: AllowedCalls,
}

impl AllowList {
    /// Parse le JSON ; `origin` n'apparaît que dans les erreurs.
    pub fn from_json(text: &str, origin: &str) -> Result<Self> {
        let fail = |reason: String| Error::AllowList { origin: origin.to_owned(), reason };
        let raw: RawAllowList = serde_json::from_str(text).map_err(|e| fail(e.to_string()))?;
        let calls = raw
            .calls
            .iter()
            .map(|c| c.parse::<ExternalCall>())
            .collect::<Result<AllowedCalls, _>>()
            .map_err(|e| fail(e.to_string()))?;
        let list = Self { target: raw.target, version: raw.version, opcodes: raw.opcodes.into_iter().collect(), calls };
        debug!(origin, target = %list.target, opcodes = list.opcodes.len(), calls = list.calls.len(), "allow-list loaded");
        Ok(list)
    }

    /// Lit un fichier JSON.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::AllowList { origin: path.to_string(), reason: e.to_string() })?;
        Self::from_json(&text, path.as_str())
    }

    /// Liste intégrée au crate.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN, "<builtin>")
    }

    /// Fichier donné ou liste intégrée.
    pub fn load_or_builtin(path: Option<&Utf8Path>) -> Result<Self> {
        path.map_or_else(Self::builtin, Self::load)
    }
}
