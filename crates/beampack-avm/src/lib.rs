//! beampack-avm: conteneur `.avm` pour runtime embarqué
//!
//! Format :
//! ```text
//! Header : "#!/usr/bin/env AtomVM\n" + 2 octets nuls (24 bytes)
//! [Record*]
//!   record = size u32 BE | flags u32 BE | 0 u32 BE
//!            | name + NUL, zéros jusqu'à multiple de 4
//!            | payload, zéros jusqu'à multiple de 4
//!   size   = longueur totale du record
//!   flags  = 0 fin, 1 démarrage, 2 continuation
//! Dernier record : name "end", flags 0, payload vide (size 16)
//! ```
//!
//! Les fichiers bruts portent un préfixe u32 BE de longueur devant leur
//! contenu ; les modules sont nommés `<module>.beam`.
//!
//! API :
//! - [`build_record`] : un record aligné
//! - [`ContainerWriter`] : modules, fichiers, corps épissés, record de fin
//! - [`Container::parse`] / [`extract_body`] : parcours validé

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{borrow::Cow, fmt};

use beampack_core::{padding_for, ByteWriter};
use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::{debug, trace};

/* ─────────────────────────── Constantes ─────────────────────────── */

/// En-tête magique (24 octets).
pub const AVM_MAGIC: [u8; 24] = *b"#!/usr/bin/env AtomVM\n\0\0";
/// Taille de l'en-tête fixe d'un record.
pub const RECORD_HEADER_LEN: usize = 12;
/// Nom du record terminal.
pub const END_NAME: &str = "end";
/// Plus petit record possible (en-tête + nom vide + NUL, aligné).
pub const MIN_RECORD_LEN: usize = 16;

/* ─────────────────────────── Erreurs ─────────────────────────── */

/// Erreurs du format conteneur.
#[derive(Debug, Error)]
pub enum AvmError {
    /// En-tête magique absent ou différent.
    #[error("bad magic header")]
    BadMagicHeader,
    /// Nom de record inutilisable (vide ou contenant NUL).
    #[error("invalid record name {0:?}")]
    InvalidName(String),
    /// Record qui ne tient pas dans un u32.
    #[error("record `{name}` too large ({size} bytes)")]
    TooLarge {
        /// Nom du record.
        name: String,
        /// Taille calculée.
        size: usize,
    },
    /// Record incohérent pendant le parcours.
    #[error("bad record at offset {offset}: {reason}")]
    BadRecord {
        /// Offset du record dans le conteneur.
        offset: usize,
        /// Détail.
        reason: Cow<'static, str>,
    },
    /// Fin du buffer sans record terminal.
    #[error("container has no end record")]
    MissingEndRecord,
    /// Rôle `end` demandé pour autre chose que le record terminal.
    #[error("role end is reserved for the terminating record, not `{0}`")]
    ReservedEndRole(String),
}

/// Alias résultat du crate.
pub type AvmResult<T> = Result<T, AvmError>;

fn bad(offset: usize, reason: impl Into<Cow<'static, str>>) -> AvmError {
    AvmError::BadRecord { offset, reason: reason.into() }
}

/* ─────────────────────────── Records ─────────────────────────── */

/// Rôle d'un record (champ `flags`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Record terminal.
    End,
    /// Point d'entrée (module de démarrage).
    Start,
    /// Contenu ordinaire.
    Continuation,
}

impl Role {
    /// Valeur du champ `flags`.
    pub const fn flags(self) -> u32 {
        match self {
            Self::End => 0,
            Self::Start => 1,
            Self::Continuation => 2,
        }
    }

    /// Rôle depuis `flags` (inconnu → `None`).
    pub const fn from_flags(flags: u32) -> Option<Self> {
        match flags {
            0 => Some(Self::End),
            1 => Some(Self::Start),
            2 => Some(Self::Continuation),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::End => "end",
            Self::Start => "start",
            Self::Continuation => "continuation",
        })
    }
}

/// Nom du record d'un module.
pub fn module_record_name(module: &str) -> String {
    format!("{module}.beam")
}

/// Construit un record complet, aligné sur 4.
///
/// [`Role::End`] n'est accepté que pour le record terminal (`"end"`, payload vide).
pub fn build_record(name: &str, payload: &[u8], role: Role) -> AvmResult<Vec<u8>> {
    if name.is_empty() || name.contains('\0') {
        return Err(AvmError::InvalidName(name.to_owned()));
    }
    if role == Role::End && (name != END_NAME || !payload.is_empty()) {
        return Err(AvmError::ReservedEndRole(name.to_owned()));
    }
    let head = RECORD_HEADER_LEN + name.len() + 1;
    let size = head + padding_for(head, 4) + payload.len() + padding_for(payload.len(), 4);
    let size32 = u32::try_from(size).map_err(|_| AvmError::TooLarge { name: name.to_owned(), size })?;

    let mut w = ByteWriter::with_capacity(size);
    w.write_u32_be(size32);
    w.write_u32_be(role.flags());
    w.write_u32_be(0);
    w.write_bytes(name.as_bytes());
    w.write_u8(0);
    w.pad_to(4);
    w.write_bytes(payload);
    w.pad_to(4);
    Ok(w.into_vec())
}

/// Payload d'un fichier brut : longueur u32 BE + contenu.
pub fn file_payload(data: &[u8]) -> AvmResult<Vec<u8>> {
    let len = u32::try_from(data.len())
        .map_err(|_| AvmError::TooLarge { name: String::from("<file>"), size: data.len() })?;
    let mut w = ByteWriter::with_capacity(4 + data.len());
    w.write_u32_be(len);
    w.write_bytes(data);
    Ok(w.into_vec())
}

/* ─────────────────────────── Écrivain ─────────────────────────── */

/// Assemble un conteneur en mémoire ; rien n'est écrit sur disque ici.
#[derive(Debug, Clone)]
pub struct ContainerWriter {
    buf: ByteWriter,
    records: usize,
}

impl Default for ContainerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerWriter {
    /// Nouveau conteneur (en-tête magique écrit).
    pub fn new() -> Self {
        let mut buf = ByteWriter::with_capacity(4096);
        buf.write_bytes(&AVM_MAGIC);
        Self { buf, records: 0 }
    }

    /// Nombre de records ajoutés (épissures comprises, fin exclue).
    pub fn records(&self) -> usize {
        self.records
    }

    /// Ajoute un record arbitraire ; le record terminal est réservé à [`Self::finish`].
    pub fn record(&mut self, name: &str, payload: &[u8], role: Role) -> AvmResult<&mut Self> {
        if role == Role::End {
            return Err(AvmError::ReservedEndRole(name.to_owned()));
        }
        let rec = build_record(name, payload, role)?;
        trace!(name, role = %role, size = rec.len(), "record appended");
        self.buf.write_bytes(&rec);
        self.records += 1;
        Ok(self)
    }

    /// Ajoute un module déjà minimisé sous `<module>.beam`.
    pub fn module(&mut self, module: &str, blob: &[u8], role: Role) -> AvmResult<&mut Self> {
        self.record(&module_record_name(module), blob, role)
    }

    /// Ajoute un fichier brut (préfixe de longueur).
    pub fn file(&mut self, name: &str, data: &[u8], role: Role) -> AvmResult<&mut Self> {
        self.record(name, &file_payload(data)?, role)
    }

    /// Recopie le corps d'un autre conteneur (voir [`extract_body`]).
    pub fn splice(&mut self, body: &[u8]) -> AvmResult<&mut Self> {
        let spliced = walk(body, 0, false)?;
        trace!(records = spliced.records.len(), bytes = body.len(), "container body spliced");
        self.buf.write_bytes(body);
        self.records += spliced.records.len();
        Ok(self)
    }

    /// Termine par le record de fin et rend les octets.
    pub fn finish(mut self) -> AvmResult<Vec<u8>> {
        let end = build_record(END_NAME, &[], Role::End)?;
        self.buf.write_bytes(&end);
        debug!(records = self.records, bytes = self.buf.len(), "container assembled");
        Ok(self.buf.into_vec())
    }
}

/* ─────────────────────────── Lecture ─────────────────────────── */

/// Un record lu depuis un conteneur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    /// Offset du record dans le buffer parcouru.
    pub offset: usize,
    /// Champ `flags` brut.
    pub flags: u32,
    /// Nom (sans NUL).
    pub name: &'a str,
    /// Payload, bourrage final compris.
    pub payload: &'a [u8],
}

impl<'a> Record<'a> {
    /// Rôle décodé, si connu.
    pub fn role(&self) -> Option<Role> {
        Role::from_flags(self.flags)
    }

    /// Vrai pour un module (`.beam` + en-tête `FOR1`).
    pub fn is_module(&self) -> bool {
        self.name.ends_with(".beam") && self.payload.starts_with(b"FOR1")
    }

    /// Nom du module pour un record `<module>.beam`.
    pub fn module_name(&self) -> Option<&'a str> {
        self.name.strip_suffix(".beam")
    }

    /// Contenu d'un fichier brut, sans préfixe ni bourrage.
    pub fn file_data(&self) -> Option<&'a [u8]> {
        let len = BigEndian::read_u32(self.payload.get(..4)?) as usize;
        self.payload.get(4..4usize.checked_add(len)?)
    }
}

/// Conteneur parcouru et validé.
#[derive(Debug, Clone)]
pub struct Container<'a> {
    /// Records hors record de fin.
    pub records: Vec<Record<'a>>,
    /// Octets entre l'en-tête et le record de fin.
    pub body: &'a [u8],
}

impl<'a> Container<'a> {
    /// Vérifie l'en-tête puis parcourt tous les records.
    pub fn parse(bytes: &'a [u8]) -> AvmResult<Self> {
        let rest = bytes.strip_prefix(&AVM_MAGIC[..]).ok_or(AvmError::BadMagicHeader)?;
        let walked = walk(rest, AVM_MAGIC.len(), true)?;
        Ok(Self { records: walked.records, body: &rest[..walked.body_len] })
    }
}

/// Corps d'un conteneur, prêt à être épissé dans un autre.
pub fn extract_body(bytes: &[u8]) -> AvmResult<&[u8]> {
    Container::parse(bytes).map(|c| c.body)
}

struct Walked<'a> {
    records: Vec<Record<'a>>,
    body_len: usize,
}

/// Parcours séquentiel : chaque taille est validée avant d'avancer.
///
/// `base` ne sert qu'aux offsets rapportés. Sans `need_end`, la fin du buffer
/// termine proprement le parcours (corps épissé) ; un record terminal y est
/// alors une erreur.
fn walk(buf: &[u8], base: usize, need_end: bool) -> AvmResult<Walked<'_>> {
    let mut records = Vec::new();
    let mut off = 0usize;
    loop {
        let at = base + off;
        let rest = &buf[off..];
        if rest.is_empty() {
            return if need_end {
                Err(AvmError::MissingEndRecord)
            } else {
                Ok(Walked { records, body_len: off })
            };
        }
        if rest.len() < 4 {
            return Err(bad(at, format!("{} trailing bytes", rest.len())));
        }
        let size = BigEndian::read_u32(rest) as usize;
        if size == 0 {
            // legacy terminator
            if !need_end {
                return Err(bad(at, "end marker inside spliced body"));
            }
            if rest.len() != 4 {
                return Err(bad(at, "data after end record"));
            }
            return Ok(Walked { records, body_len: off });
        }
        if size < MIN_RECORD_LEN || size % 4 != 0 {
            return Err(bad(at, format!("size {size} is not a multiple of 4 >= {MIN_RECORD_LEN}")));
        }
        if size > rest.len() {
            return Err(bad(at, format!("size {size} exceeds the {} remaining bytes", rest.len())));
        }
        let rec = &rest[..size];
        let flags = BigEndian::read_u32(&rec[4..8]);
        let name_area = &rec[RECORD_HEADER_LEN..];
        let nul = name_area.iter().position(|&b| b == 0).ok_or_else(|| bad(at, "unterminated name"))?;
        let name = std::str::from_utf8(&name_area[..nul]).map_err(|_| bad(at, "name is not utf-8"))?;
        let head = RECORD_HEADER_LEN + nul + 1;
        let payload = &rec[head + padding_for(head, 4)..];

        if flags == Role::End.flags() {
            if name != END_NAME {
                return Err(bad(at, format!("record `{name}` has the end role")));
            }
            if size != MIN_RECORD_LEN {
                return Err(bad(at, "end record carries a payload"));
            }
            if !need_end {
                return Err(bad(at, "end marker inside spliced body"));
            }
            if size != rest.len() {
                return Err(bad(at, "data after end record"));
            }
            return Ok(Walked { records, body_len: off });
        }
        records.push(Record { offset: at, flags, name, payload });
        off += size;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn sample() -> Vec<u8> {
        let mut w = ContainerWriter::new();
        w.module("app", b"FOR1\0\0\0\x04BEAM", Role::Start).unwrap();
        w.file("priv/config.txt", b"abc", Role::Continuation).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn record_layout() -> AvmResult<()> {
        let rec = build_record("a.beam", b"12345", Role::Start)?;
        // 12 + "a.beam\0" (7) -> 19 + 1 pad = 20, payload 5 + 3 pad
        assert_eq!(rec.len(), 28);
        assert_eq!(&rec[..4], &28u32.to_be_bytes());
        assert_eq!(&rec[4..8], &1u32.to_be_bytes());
        assert_eq!(&rec[8..12], &[0; 4]);
        assert_eq!(&rec[12..20], b"a.beam\0\0");
        assert_eq!(&rec[20..], b"12345\0\0\0");
        Ok(())
    }

    #[test]
    fn end_record_is_sixteen_bytes() -> AvmResult<()> {
        let end = build_record(END_NAME, &[], Role::End)?;
        assert_eq!(end, [&16u32.to_be_bytes()[..], &[0; 8], b"end\0"].concat());
        Ok(())
    }

    #[test]
    fn names_are_checked() {
        assert!(matches!(build_record("a\0b", b"", Role::Start), Err(AvmError::InvalidName(_))));
        assert!(matches!(build_record("", b"", Role::Start), Err(AvmError::InvalidName(_))));
    }

    #[test]
    fn container_roundtrip() -> AvmResult<()> {
        let bytes = sample();
        assert_eq!(&bytes[..24], &AVM_MAGIC);
        assert_eq!(bytes.len() % 4, 0);

        let c = Container::parse(&bytes)?;
        assert_eq!(c.records.len(), 2);
        assert_eq!(c.records[0].name, "app.beam");
        assert_eq!(c.records[0].role(), Some(Role::Start));
        assert!(c.records[0].is_module());
        assert_eq!(c.records[0].module_name(), Some("app"));
        assert_eq!(c.records[1].role(), Some(Role::Continuation));
        assert_eq!(c.records[1].file_data(), Some(&b"abc"[..]));
        assert!(!c.records[1].is_module());
        assert_eq!(c.body, &bytes[24..bytes.len() - 16]);
        Ok(())
    }

    #[test]
    fn splicing_keeps_records() -> AvmResult<()> {
        let inner = sample();
        let mut outer = ContainerWriter::new();
        outer.file("readme", b"hi", Role::Continuation)?;
        outer.splice(extract_body(&inner)?)?;
        assert_eq!(outer.records(), 3);
        let bytes = outer.finish()?;

        let names: Vec<_> = Container::parse(&bytes)?.records.iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["readme", "app.beam", "priv/config.txt"]);

        // re-extracting a body made only of a spliced body is idempotent
        let mut again = ContainerWriter::new();
        again.splice(extract_body(&inner)?)?;
        assert_eq!(again.finish()?, inner);
        Ok(())
    }

    #[test]
    fn bad_magic() {
        let mut bytes = sample();
        bytes[2] = b'X';
        assert!(matches!(extract_body(&bytes), Err(AvmError::BadMagicHeader)));
        assert!(matches!(extract_body(b"short"), Err(AvmError::BadMagicHeader)));
    }

    #[test]
    fn missing_end() {
        let bytes = sample();
        let cut = &bytes[..bytes.len() - 16];
        assert!(matches!(extract_body(cut), Err(AvmError::MissingEndRecord)));
    }

    #[test]
    fn legacy_zero_terminator() -> AvmResult<()> {
        let mut bytes = sample();
        let n = bytes.len();
        bytes.truncate(n - 16);
        bytes.extend_from_slice(&[0; 4]);
        assert_eq!(Container::parse(&bytes)?.records.len(), 2);
        Ok(())
    }

    #[test]
    fn hostile_sizes_are_rejected() {
        let good = sample();
        for size in [3u32, 18, 0x7FFF_FFF0] {
            let mut bytes = good.clone();
            bytes[24..28].copy_from_slice(&size.to_be_bytes());
            assert!(matches!(extract_body(&bytes), Err(AvmError::BadRecord { offset: 24, .. })), "size {size}");
        }

        let mut no_nul = AVM_MAGIC.to_vec();
        no_nul.extend(16u32.to_be_bytes());
        no_nul.extend([0, 0, 0, 2, 0, 0, 0, 0]);
        no_nul.extend(b"abcd");
        assert!(matches!(extract_body(&no_nul), Err(AvmError::BadRecord { .. })));
    }

    #[test]
    fn end_role_is_reserved() -> AvmResult<()> {
        assert!(matches!(build_record("app.beam", b"FOR1", Role::End), Err(AvmError::ReservedEndRole(_))));
        assert!(matches!(build_record(END_NAME, b"x", Role::End), Err(AvmError::ReservedEndRole(_))));

        let mut w = ContainerWriter::new();
        assert!(matches!(w.record("app.beam", b"FOR1", Role::End), Err(AvmError::ReservedEndRole(_))));
        assert!(matches!(w.record(END_NAME, b"", Role::End), Err(AvmError::ReservedEndRole(_))));
        assert!(matches!(w.module("app", b"FOR1", Role::End), Err(AvmError::ReservedEndRole(_))));
        assert!(matches!(w.file("cfg", b"abc", Role::End), Err(AvmError::ReservedEndRole(_))));
        assert_eq!(w.records(), 0);
        assert_eq!(Container::parse(&w.finish()?)?.records.len(), 0);
        Ok(())
    }

    #[test]
    fn flags_zero_must_be_the_end_record() {
        // hand-written flags-0 record named app.beam ahead of a real end record
        let mut bytes = AVM_MAGIC.to_vec();
        bytes.extend(24u32.to_be_bytes());
        bytes.extend([0; 8]);
        bytes.extend(b"app.beam\0\0\0\0");
        bytes.extend(build_record(END_NAME, &[], Role::End).unwrap());
        assert!(matches!(extract_body(&bytes), Err(AvmError::BadRecord { offset: 24, .. })));

        // end record with a payload
        let mut bytes = AVM_MAGIC.to_vec();
        bytes.extend(20u32.to_be_bytes());
        bytes.extend([0; 8]);
        bytes.extend(b"end\0abcd");
        assert!(matches!(extract_body(&bytes), Err(AvmError::BadRecord { .. })));
    }

    #[test]
    fn nothing_may_follow_the_end_record() {
        let mut bytes = sample();
        bytes.extend_from_slice(b"GARBAGE!");
        let err = extract_body(&bytes).unwrap_err();
        assert!(err.to_string().contains("data after end record"), "{err}");

        let mut legacy = sample();
        let n = legacy.len();
        legacy.truncate(n - 16);
        legacy.extend_from_slice(&[0; 8]);
        assert!(matches!(Container::parse(&legacy), Err(AvmError::BadRecord { .. })));
    }

    #[test]
    fn splice_rejects_end_marker() {
        let bytes = sample();
        let mut w = ContainerWriter::new();
        assert!(w.splice(&bytes[24..]).is_err());
    }

    proptest! {
        #[test]
        fn records_are_aligned(name in "[a-z/._]{1,40}", payload in proptest::collection::vec(any::<u8>(), 0..300)) {
            let rec = build_record(&name, &payload, Role::Continuation).unwrap();
            prop_assert_eq!(rec.len() % 4, 0);
            prop_assert_eq!(BigEndian::read_u32(&rec[..4]) as usize, rec.len());

            let mut w = ContainerWriter::new();
            w.file(&name, &payload, Role::Continuation).unwrap();
            let bytes = w.finish().unwrap();
            let c = Container::parse(&bytes).unwrap();
            prop_assert_eq!(c.records[0].name, name.as_str());
            prop_assert_eq!(c.records[0].file_data(), Some(&payload[..]));
        }
    }
}
