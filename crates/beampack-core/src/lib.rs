//! beampack-core: primitives partagées pour les modules BEAM compilés
//!
//! Fournit :
//! - `ChunkTag` (fourcc) + tags connus (`AtU8`, `Code`, `LitT`, `LitU`…)
//! - IO mémoire (big-endian) : `ByteWriter`, `ByteReader`
//! - [`chunk`] : lecture/écriture du conteneur `FOR1`/`BEAM`
//! - [`literals`] : normalisation de la table de littéraux (`LitT` → `LitU`)
//! - [`module`] : tables (atomes, imports, exports) + repackaging minimal
//! - [`bytecode`] : décodeur compact-term, table d'opcodes, désassembleur, parcours
//! - [`verify`] : extraction opcodes / appels externes et diff contre allow-lists
//! - Erreurs `CoreError` + alias `CoreResult<T>`
//!
//! Features :
//! - `serde` (par défaut) : derive `Serialize` sur le rapport de vérification

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{borrow::Cow, fmt};

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/* ─────────────────────────── Modules publics ─────────────────────────── */

/// Conteneur de chunks `FOR1`/`BEAM` (décodage / ré-encodage).
pub mod chunk;
/// Normalisation de la table de littéraux.
pub mod literals;
/// Tables d'un module et repackaging minimal.
pub mod module;
/// Bytecode : termes compacts, opcodes, désassemblage, parcours générique.
pub mod bytecode;
/// Vérification de compatibilité (opcodes + appels externes).
pub mod verify;

/// Assembleur de fixtures (feature `fixtures`).
#[cfg(any(test, feature = "fixtures"))]
pub use bytecode::asm;

/// Module de référence : `tests/data/hello.erl`, encodé selon le listing `hello.S`.
#[cfg(test)]
pub(crate) const HELLO_BEAM: &[u8] = include_bytes!("../tests/data/hello.beam");

/* ─────────────────────────── Résultat commun ─────────────────────────── */

/// Alias résultat commun au core.
pub type CoreResult<T> = core::result::Result<T, CoreError>;

/* ─────────────────────────── Tags de chunk ─────────────────────────── */

/// Tag de chunk (fourcc), exactement 4 octets ASCII.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkTag(pub [u8; 4]);

impl ChunkTag {
    /// Table d'atomes UTF-8.
    pub const ATU8: Self = Self(*b"AtU8");
    /// Table d'atomes latin-1 (ancien format).
    pub const ATOM: Self = Self(*b"Atom");
    /// Code (instructions génériques).
    pub const CODE: Self = Self(*b"Code");
    /// Table des exports.
    pub const EXPT: Self = Self(*b"ExpT");
    /// Table des fonctions locales.
    pub const LOCT: Self = Self(*b"LocT");
    /// Table des imports.
    pub const IMPT: Self = Self(*b"ImpT");
    /// Littéraux tels qu'écrits par le compilateur (préfixe + zlib ou brut).
    pub const LITT: Self = Self(*b"LitT");
    /// Littéraux normalisés, non compressés.
    pub const LITU: Self = Self(*b"LitU");
    /// Table des funs (closures).
    pub const FUNT: Self = Self(*b"FunT");
    /// Table des chaînes (binaires littéraux).
    pub const STRT: Self = Self(*b"StrT");
    /// Informations de lignes.
    pub const LINE: Self = Self(*b"Line");

    /// Construit un tag depuis un slice (doit faire 4 octets).
    pub fn from_slice(b: &[u8]) -> Option<Self> {
        <[u8; 4]>::try_from(b).ok().map(Self)
    }

    /// Vrai si les 4 octets sont des caractères ASCII alphanumériques.
    pub fn is_well_formed(&self) -> bool {
        self.0.iter().all(u8::is_ascii_alphanumeric)
    }

    /// Octets bruts du tag.
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for ChunkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02X}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ChunkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkTag({self})")
    }
}

/* ─────────────────────────── Byte Writer (BE) ─────────────────────────── */

/// Buffer d'écriture (croît automatiquement).
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Crée un writer vide.
    pub fn new() -> Self { Self { buf: Vec::new() } }
    /// Crée un writer avec une capacité réservée.
    pub fn with_capacity(cap: usize) -> Self { Self { buf: Vec::with_capacity(cap) } }
    /// Accès en lecture au contenu.
    pub fn as_slice(&self) -> &[u8] { &self.buf }
    /// Nombre d'octets écrits.
    pub fn len(&self) -> usize { self.buf.len() }
    /// Vrai si rien n'a été écrit.
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }
    /// Récupère le buffer (consomme).
    pub fn into_vec(self) -> Vec<u8> { self.buf }
    /// Ajoute des octets bruts.
    pub fn write_bytes(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }
    /// Écrit un tag (fourcc).
    pub fn write_tag(&mut self, tag: ChunkTag) { self.write_bytes(tag.as_bytes()); }
    /// Écrit un octet.
    pub fn write_u8(&mut self, v: u8) { self.buf.push(v); }
    /// Écrit un u16 big-endian.
    pub fn write_u16_be(&mut self, v: u16) { self.buf.extend_from_slice(&v.to_be_bytes()); }
    /// Écrit un u32 big-endian.
    pub fn write_u32_be(&mut self, v: u32) { self.buf.extend_from_slice(&v.to_be_bytes()); }
    /// Complète avec des zéros jusqu'au prochain multiple de `align`.
    pub fn pad_to(&mut self, align: usize) {
        let pad = padding_for(self.buf.len(), align);
        self.buf.resize(self.buf.len() + pad, 0);
    }
}

/// Nombre d'octets de bourrage pour aligner `len` sur `align`.
pub const fn padding_for(len: usize, align: usize) -> usize {
    (align - len % align) % align
}

/* ─────────────────────────── Byte Reader (BE) ─────────────────────────── */

/// Lecteur séquentiel sur un slice d'octets (helpers BE).
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    /// Construit un lecteur.
    pub fn new(data: &'a [u8]) -> Self { Self { data, off: 0 } }
    /// Offset courant.
    pub fn offset(&self) -> usize { self.off }
    /// Taille restante.
    pub fn remaining(&self) -> usize { self.data.len().saturating_sub(self.off) }
    /// Vrai si tout a été consommé.
    pub fn is_empty(&self) -> bool { self.remaining() == 0 }
    /// Reste non consommé.
    pub fn rest(&self) -> &'a [u8] { &self.data[self.off.min(self.data.len())..] }

    /// Lit `n` octets (ou erreur si EOF).
    pub fn read_bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::UnexpectedEof { needed: n as u64, at: self.off as u64 });
        }
        let start = self.off;
        self.off += n;
        Ok(&self.data[start..self.off])
    }

    /// Avance de `n` octets.
    pub fn skip(&mut self, n: usize) -> CoreResult<()> {
        self.read_bytes(n).map(|_| ())
    }

    /// Lit un tag (fourcc).
    pub fn read_tag(&mut self) -> CoreResult<ChunkTag> {
        let b = self.read_bytes(4)?;
        Ok(ChunkTag([b[0], b[1], b[2], b[3]]))
    }

    /// Lit un octet.
    pub fn read_u8(&mut self) -> CoreResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Lit un u16 BE.
    pub fn read_u16_be(&mut self) -> CoreResult<u16> {
        Ok(BigEndian::read_u16(self.read_bytes(2)?))
    }

    /// Lit un u32 BE.
    pub fn read_u32_be(&mut self) -> CoreResult<u32> {
        Ok(BigEndian::read_u32(self.read_bytes(4)?))
    }

    /// Lit un i32 BE.
    pub fn read_i32_be(&mut self) -> CoreResult<i32> {
        Ok(BigEndian::read_i32(self.read_bytes(4)?))
    }
}

/* ─────────────────────────── Erreurs ─────────────────────────── */

/// Erreurs de bas niveau communes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Fichier source illisible.
    #[error("cannot read module `{path}`: {source}")]
    ModuleRead {
        /// Chemin demandé.
        path: String,
        /// Erreur d'E/S sous-jacente.
        #[source]
        source: std::io::Error,
    },
    /// Structure de chunks corrompue (table tronquée, tag invalide, tailles incohérentes).
    #[error("malformed module: {0}")]
    MalformedContainer(Cow<'static, str>),
    /// Décompression de la table de littéraux impossible.
    #[error("literal table decode failed: {0}")]
    LiteralDecode(Cow<'static, str>),
    /// Fin de buffer inattendue.
    #[error("unexpected EOF: need {needed} bytes at {at}")]
    UnexpectedEof {
        /// Nombre d'octets manquants.
        needed: u64,
        /// Offset où l'erreur s'est produite.
        at: u64,
    },
    /// Opcode inconnu dans le chunk `Code`.
    #[error("unknown opcode {opcode} at code offset {at}")]
    UnknownOpcode {
        /// Numéro d'opcode lu.
        opcode: u8,
        /// Offset dans le flux d'instructions.
        at: usize,
    },
    /// UTF-8 invalide (table d'atomes).
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
}

impl CoreError {
    /// Construit une erreur « conteneur malformé ».
    pub fn malformed(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::MalformedContainer(msg.into())
    }

    /// Construit une erreur « littéraux illisibles ».
    pub fn literal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::LiteralDecode(msg.into())
    }
}

/* ─────────────────────────── Prélude (reexports utiles) ─────────────────────────── */

/// Prélude pratique pour importer les types/funcs clés du crate.
pub mod prelude {
    /// Réexports utiles pour une importation rapide.
    pub use super::{
        bytecode::{scan, Function, Instruction, Location, Opcode, Operand},
        chunk::{decode, encode, ChunkMap},
        literals::normalize_literals,
        module::{repackage, BeamModule, RepackOptions, Repackaged},
        verify::{verify, AllowedCalls, CallSite, ExternalCall, Report},
        padding_for, ByteReader, ByteWriter, ChunkTag, CoreError, CoreResult,
    };
}

/* ─────────────────────────── Tests ─────────────────────────── */
