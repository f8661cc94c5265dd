//! Vérification d'un ensemble de modules contre une allow-list.
//!
//! Les fonctions exportées par les modules vérifiés et par les dépendances
//! (modules isolés ou records module des conteneurs) comptent comme
//! autorisées.

use beampack_avm::Container;
use beampack_core::{
    module::BeamModule,
    verify::{exported_calls, verify, AllowedCalls, Report},
};
use byteorder::{BigEndian, ByteOrder};
use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::{
    allowlist::AllowList,
    deps::DependencyArtifact,
    pack::{FsReader, SourceReader},
    Error, Result,
};

/// Vérifie les modules de `paths` lus sur disque.
pub fn verify_modules<P: AsRef<Utf8Path>>(
    paths: &[P],
    deps: &[DependencyArtifact],
    allow: &AllowList,
) -> Result<Report> {
    verify_modules_with(&FsReader, paths, deps, allow)
}

/// [`verify_modules`] avec un lecteur fourni.
pub fn verify_modules_with<R, P>(reader: &R, paths: &[P], deps: &[DependencyArtifact], allow: &AllowList) -> Result<Report>
where
    R: SourceReader + ?Sized,
    P: AsRef<Utf8Path>,
{
    let modules = paths
        .iter()
        .map(|p| load_module(reader, p.as_ref()))
        .collect::<Result<Vec<_>>>()?;

    let mut locally_exported = exported_calls(&modules);
    locally_exported.extend(dependency_exports(reader, deps)?);

    let report = verify(&modules, &allow.opcodes, &allow.calls, &locally_exported);
    if report.is_ok() {
        info!(modules = modules.len(), target = %allow.target, "all opcodes and calls supported");
    } else {
        warn!(
            modules = modules.len(),
            target = %allow.target,
            opcodes = report.missing_opcodes.len(),
            calls = report.missing_calls.len(),
            "unsupported instructions found"
        );
    }
    Ok(report)
}

fn load_module<R: SourceReader + ?Sized>(reader: &R, path: &Utf8Path) -> Result<BeamModule> {
    let bytes = reader.read(path).map_err(|source| Error::ModuleRead { path: path.to_owned(), source })?;
    let module = BeamModule::parse(&bytes).map_err(|source| Error::Module { path: path.to_owned(), source })?;
    Ok(module.with_source(path.as_str()))
}

/// Exports de toutes les dépendances.
pub fn dependency_exports<R: SourceReader + ?Sized>(reader: &R, deps: &[DependencyArtifact]) -> Result<AllowedCalls> {
    let mut modules = Vec::new();
    for dep in deps {
        match dep {
            DependencyArtifact::Module(path) => modules.push(load_module(reader, path)?),
            DependencyArtifact::Container(path) => {
                let bytes = reader.read(path).map_err(|source| Error::ModuleRead { path: path.clone(), source })?;
                let container = Container::parse(&bytes).map_err(|source| Error::Container { path: path.clone(), source })?;
                for record in container.records.iter().filter(|r| r.is_module()) {
                    let module = BeamModule::parse(form_bytes(record.payload))
                        .map_err(|source| Error::Module { path: path.join(record.name), source })?;
                    modules.push(module);
                }
            }
        }
    }
    let exports = exported_calls(&modules);
    debug!(dependencies = deps.len(), modules = modules.len(), exports = exports.len(), "dependency exports collected");
    Ok(exports)
}

/// Payload de record sans le bourrage final : `FOR1` + taille + contenu.
fn form_bytes(payload: &[u8]) -> &[u8] {
    payload
        .get(4..8)
        .and_then(|size| usize::try_from(BigEndian::read_u32(size)).ok())
        .and_then(|size| size.checked_add(8))
        .and_then(|end| payload.get(..end))
        .unwrap_or(payload)
}

#[cfg(test)]
mod tests {
    use beampack_avm::{ContainerWriter, Role};
    use beampack_core::{
        asm::{ModuleBuilder, Operand},
        bytecode::Opcode,
        verify::ExternalCall,
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::pack::MemoryReader;

    fn allow(opcodes: &[&str], calls: &[&str]) -> AllowList {
        AllowList {
            target: "test".into(),
            version: "0".into(),
            opcodes: opcodes.iter().map(|s| (*s).to_owned()).collect(),
            calls: calls.iter().map(|c| c.parse().unwrap()).collect(),
        }
    }

    fn caller(name: &str, target: (&str, &str, u32)) -> Vec<u8> {
        let mut b = ModuleBuilder::new(name);
        let imp = b.import(target.0, target.1, target.2);
        b.function("run", 0, true, &[
            (Opcode::CALL_EXT_ONLY, vec![Operand::Unsigned(target.2.into()), Operand::Unsigned(imp.into())]),
        ]);
        b.build()
    }

    fn library(name: &str, function: &str) -> Vec<u8> {
        let mut b = ModuleBuilder::new(name);
        b.function(function, 1, true, &[(Opcode::RETURN, vec![])]);
        b.build()
    }

    const BASE: &[&str] = &["label", "func_info", "int_code_end", "call_ext_only", "return"];

    #[test]
    fn clean_module_passes() -> Result<()> {
        let mut r = MemoryReader::new();
        r.insert("app.beam", caller("app", ("erlang", "self", 0)));
        let report = verify_modules_with(&r, &["app.beam"], &[], &allow(BASE, &["erlang:self/0"]))?;
        assert!(report.is_ok());
        Ok(())
    }

    #[test]
    fn reference_module_fits_builtin_list() -> Result<()> {
        let mut r = MemoryReader::new();
        r.insert("ebin/hello.beam", include_bytes!("../../beampack-core/tests/data/hello.beam").to_vec());
        let report = verify_modules_with(&r, &["ebin/hello.beam"], &[], &AllowList::builtin()?)?;
        assert!(report.is_ok(), "{report}");
        Ok(())
    }

    #[test]
    fn violations_carry_call_sites() -> Result<()> {
        let mut r = MemoryReader::new();
        r.insert("app.beam", caller("app", ("ets", "new", 2)));
        let report = verify_modules_with(&r, &["app.beam"], &[], &allow(&["label", "func_info"], &[]))?;

        let ops: Vec<_> = report.missing_opcodes.iter().map(String::as_str).collect();
        assert_eq!(ops, vec!["call_ext_only", "return"]);
        let sites = &report.missing_calls[&ExternalCall::new("ets", "new", 2)];
        let site = sites.iter().next().unwrap();
        assert_eq!(site.to_string(), "app:run/0 (app.beam)");
        Ok(())
    }

    #[test]
    fn sibling_and_dependency_exports_are_allowed() -> Result<()> {
        let mut container = ContainerWriter::new();
        container.module("json", &library("json", "decode"), Role::Continuation).unwrap();
        let mut r = MemoryReader::new();
        r.insert("app.beam", caller("app", ("util", "helper", 1)));
        r.insert("util.beam", library("util", "helper"));
        r.insert("web.beam", caller("web", ("json", "decode", 1)));
        r.insert("log.beam", caller("log", ("logger", "info", 1)));
        r.insert("deps/logger.beam", library("logger", "info"));
        r.insert("deps/json.avm", container.finish().unwrap());
        let deps = [
            DependencyArtifact::Module("deps/logger.beam".into()),
            DependencyArtifact::Container("deps/json.avm".into()),
        ];

        let report = verify_modules_with(&r, &["app.beam", "util.beam", "web.beam", "log.beam"], &deps, &allow(BASE, &[]))?;
        assert_eq!(report, Report::default());

        // without dependencies the json and logger calls are missing
        let report = verify_modules_with(&r, &["web.beam", "log.beam"], &[], &allow(BASE, &[]))?;
        let calls: Vec<_> = report.missing_calls.keys().map(ToString::to_string).collect();
        assert_eq!(calls, vec!["json:decode/1", "logger:info/1"]);
        Ok(())
    }

    #[test]
    fn unreadable_inputs_are_named() {
        let mut r = MemoryReader::new();
        r.insert("broken.beam", b"FOR1\0\0\0\x04BEAM".to_vec());
        r.insert("bad.avm", b"nope".to_vec());
        let list = allow(BASE, &[]);

        let err = verify_modules_with(&r, &["missing.beam"], &[], &list).unwrap_err();
        assert!(matches!(&err, Error::ModuleRead { path, .. } if path == "missing.beam"));
        let err = verify_modules_with(&r, &["broken.beam"], &[], &list).unwrap_err();
        assert!(matches!(&err, Error::Module { path, .. } if path == "broken.beam"));
        let deps = [DependencyArtifact::Container("bad.avm".into())];
        assert!(matches!(verify_modules_with(&r, &[] as &[&str], &deps, &list), Err(Error::Container { .. })));
    }

    #[test]
    fn form_bytes_drops_record_padding() {
        let blob = library("pad", "f");
        let mut padded = blob.clone();
        padded.extend_from_slice(&[0, 0]);
        assert_eq!(form_bytes(&padded), &blob[..]);
        assert_eq!(form_bytes(b"FOR"), b"FOR");
    }
}
