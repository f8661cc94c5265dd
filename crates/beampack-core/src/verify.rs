//! Compatibility check: opcodes and external calls against allow-lists.
//!
//! Both extractions are [`scan`] visitors over the same disassembly. The
//! allow-lists are plain data handed in by the caller; unsupported items are
//! collected into a [`Report`], never raised as errors.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use thiserror::Error;
use tracing::debug;

use crate::{
    bytecode::{scan, Instruction, Location},
    module::BeamModule,
};

/// Owner used for built-in function calls.
pub const BIF_OWNER: &str = "erlang";

/// Fully qualified function: `module:function/arity`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExternalCall {
    /// Owner module.
    pub module: String,
    /// Function name.
    pub function: String,
    /// Arity.
    pub arity: u32,
}

impl ExternalCall {
    /// Build from parts.
    pub fn new(module: impl Into<String>, function: impl Into<String>, arity: u32) -> Self {
        Self { module: module.into(), function: function.into(), arity }
    }
}

impl fmt::Display for ExternalCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.module, self.function, self.arity)
    }
}

/// Rejected `module:function/arity` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid call `{0}` (expected module:function/arity)")]
pub struct ParseCallError(pub String);

impl FromStr for ExternalCall {
    type Err = ParseCallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseCallError(s.to_owned());
        let (qualified, arity) = s.rsplit_once('/').ok_or_else(bad)?;
        let (module, function) = qualified.split_once(':').ok_or_else(bad)?;
        if module.is_empty() || function.is_empty() {
            return Err(bad());
        }
        let arity = arity.parse().map_err(|_| bad())?;
        Ok(Self::new(module, function, arity))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ExternalCall {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where a call was made from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CallSite {
    /// Calling module.
    pub module: String,
    /// Calling function.
    pub function: String,
    /// Calling function arity.
    pub arity: u32,
    /// Source hint (module path), when known.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub file: Option<String>,
}

impl CallSite {
    fn at(loc: &Location<'_>, file: Option<&str>) -> Self {
        Self {
            module: loc.module.to_owned(),
            function: loc.function.to_owned(),
            arity: loc.arity,
            file: file.map(str::to_owned),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.module, self.function, self.arity)?;
        if let Some(file) = &self.file {
            write!(f, " ({file})")?;
        }
        Ok(())
    }
}

/// Set of permitted external calls.
pub type AllowedCalls = BTreeSet<ExternalCall>;

/// Outcome of [`verify`]. Empty sets mean the modules are compatible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Report {
    /// Mnemonics used but not allowed.
    pub missing_opcodes: BTreeSet<String>,
    /// Disallowed calls and every place they are made from.
    pub missing_calls: BTreeMap<ExternalCall, BTreeSet<CallSite>>,
}

impl Report {
    /// No violation found.
    pub fn is_ok(&self) -> bool {
        self.missing_opcodes.is_empty() && self.missing_calls.is_empty()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("all opcodes and calls supported");
        }
        if !self.missing_opcodes.is_empty() {
            let list: Vec<&str> = self.missing_opcodes.iter().map(String::as_str).collect();
            writeln!(f, "unsupported opcodes ({}): {}", list.len(), list.join(", "))?;
        }
        if !self.missing_calls.is_empty() {
            writeln!(f, "unsupported calls ({}):", self.missing_calls.len())?;
            for (call, sites) in &self.missing_calls {
                writeln!(f, "  {call}")?;
                for site in sites {
                    writeln!(f, "    called from {site}")?;
                }
            }
        }
        Ok(())
    }
}

/* ─────────────────────────── Extraction ─────────────────────────── */

/// Allow-list key for an instruction.
///
/// Comparison tests, each bif arity (`bif0`..`gc_bif3`), tail and non-tail
/// external calls and frame release (`deallocate`, `trim`) are distinct
/// generic opcodes, so the opcode name is already the refined key.
pub fn mnemonic(instr: &Instruction) -> &'static str {
    instr.opcode.name()
}

/// Every mnemonic used by `modules`.
pub fn extract_opcodes(modules: &[BeamModule]) -> BTreeSet<String> {
    modules.iter().fold(BTreeSet::new(), |acc, m| {
        scan(m, acc, |instr, _, acc| {
            if !acc.contains(mnemonic(instr)) {
                acc.insert(mnemonic(instr).to_owned());
            }
        })
    })
}

/// External calls made by one module, with their call sites.
///
/// Calls into the module itself are skipped; built-ins are attributed to
/// [`BIF_OWNER`] whatever their import row says.
pub fn extract_calls(module: &BeamModule) -> Vec<(ExternalCall, CallSite)> {
    let file = module.source.as_deref();
    scan(module, Vec::new(), |instr, loc, acc| {
        let Some(index) = instr.import_index() else { return };
        // indices are checked against ImpT when the module is parsed
        let Some((owner, function, arity)) = usize::try_from(index).ok().and_then(|i| module.import(i)) else {
            return;
        };
        let call = if instr.is_bif() {
            ExternalCall::new(BIF_OWNER, function, arity)
        } else if owner == module.name {
            return;
        } else {
            ExternalCall::new(owner, function, arity)
        };
        acc.push((call, CallSite::at(loc, file)));
    })
}

/// Functions exported by `modules`, as callable identifiers.
pub fn exported_calls(modules: &[BeamModule]) -> AllowedCalls {
    modules
        .iter()
        .flat_map(|m| m.exported().map(move |(f, a)| ExternalCall::new(m.name.as_str(), f, a)))
        .collect()
}

/* ─────────────────────────── Verification ─────────────────────────── */

/// Diff what `modules` use against the allow-lists.
///
/// `locally_exported` (siblings and dependencies) counts as allowed.
pub fn verify(
    modules: &[BeamModule],
    allowed_opcodes: &BTreeSet<String>,
    allowed_calls: &AllowedCalls,
    locally_exported: &AllowedCalls,
) -> Report {
    let missing_opcodes: BTreeSet<String> = extract_opcodes(modules)
        .into_iter()
        .filter(|op| !allowed_opcodes.contains(op))
        .collect();

    let allowed: AllowedCalls = allowed_calls.union(locally_exported).cloned().collect();
    let mut missing_calls: BTreeMap<ExternalCall, BTreeSet<CallSite>> = BTreeMap::new();
    for (call, site) in modules.iter().flat_map(extract_calls) {
        if !allowed.contains(&call) {
            missing_calls.entry(call).or_default().insert(site);
        }
    }

    debug!(
        modules = modules.len(),
        missing_opcodes = missing_opcodes.len(),
        missing_calls = missing_calls.len(),
        "verification done"
    );
    Report { missing_opcodes, missing_calls }
}
