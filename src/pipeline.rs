// This module drives a generation run over an explicit registry of snippet definitions. Each
// selected snippet is synthesized once, then its variants are processed in parallel on scoped
// threads: write the C source, compile it to IR, rewrite the calling convention, compile the
// rewritten IR to an object and inspect the object. Every variant works on its own files in the
// scratch directory, named after the snippet and variant index, so the threads share nothing
// but read-only inputs. Results are collected in variant order and the first failure, in that
// order, aborts the run. Emission happens afterwards on the calling thread in registry order,
// which keeps the generated file deterministic. The artifact is only written by write_artifact,
// through a temporary sibling file renamed into place, so a failed run leaves no partial output.

//! Generation run driver.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;

use tempfile::{NamedTempFile, TempDir};

use crate::core::{GenConfig, GenError, GenResult, VariantKey};
use crate::emit::{render_file, SnippetTemplates};
use crate::inspect::{inspect_file, CapturedCode, Declarations};
use crate::snippet::SnippetDef;
use crate::synth::{synthesize, SynthesizedSnippet};
use crate::toolchain::Toolchain;
use crate::transform::{ConventionRewriter, RewriteContext};
use crate::x64::GhcRegisterTable;

/// Scratch directory of one run.
enum Scratch {
    Temp(TempDir),
    Kept(PathBuf),
}

impl Scratch {
    fn path(&self) -> &Path {
        match self {
            Scratch::Temp(dir) => dir.path(),
            Scratch::Kept(path) => path,
        }
    }
}

fn io_error(at: &VariantKey, path: &Path) -> impl FnOnce(io::Error) -> GenError {
    let at = at.clone();
    let path = path.to_path_buf();
    move |source| GenError::Io { at, path, source }
}

fn open_scratch(config: &GenConfig) -> GenResult<Scratch> {
    let at = VariantKey::new("*", 0);
    if let Some(dir) = &config.work_dir {
        fs::create_dir_all(dir).map_err(io_error(&at, dir))?;
        return Ok(Scratch::Kept(dir.clone()));
    }
    let dir = TempDir::with_prefix("snipgen-").map_err(io_error(&at, &std::env::temp_dir()))?;
    if config.keep_temps {
        let path = dir.keep();
        log::info!("keeping intermediate files in {}", path.display());
        return Ok(Scratch::Kept(path));
    }
    Ok(Scratch::Temp(dir))
}

/// The snippets `config.only` selects, in registry order.
fn select<'r>(registry: &'r [SnippetDef], config: &GenConfig) -> GenResult<Vec<&'r SnippetDef>> {
    if let Some(missing) = config
        .only
        .iter()
        .find(|name| !registry.iter().any(|def| def.name == name.as_str()))
    {
        return Err(GenError::MalformedSnippetDefinition {
            at: VariantKey::new(missing.as_str(), 0),
            reason: "no such snippet in the registry".to_string(),
        });
    }
    Ok(registry
        .iter()
        .filter(|def| config.only.is_empty() || config.only.iter().any(|n| n == def.name))
        .collect())
}

/// One generation run.
pub struct Generator<'a> {
    toolchain: &'a dyn Toolchain,
    rewriter: &'a dyn ConventionRewriter,
    table: GhcRegisterTable,
    config: &'a GenConfig,
}

impl<'a> Generator<'a> {
    pub fn new(
        toolchain: &'a dyn Toolchain,
        rewriter: &'a dyn ConventionRewriter,
        config: &'a GenConfig,
    ) -> Self {
        Self {
            toolchain,
            rewriter,
            table: GhcRegisterTable::default(),
            config,
        }
    }

    pub fn with_register_table(mut self, table: GhcRegisterTable) -> Self {
        self.table = table;
        self
    }

    /// Run the pipeline and return the generated Rust source.
    pub fn run(&self, registry: &[SnippetDef]) -> GenResult<String> {
        let selected = select(registry, self.config)?;
        let scratch = open_scratch(self.config)?;
        log::info!(
            "generating {} snippets for {} in {}",
            selected.len(),
            self.toolchain.target().triple(),
            scratch.path().display()
        );

        let mut snippets = Vec::with_capacity(selected.len());
        for def in selected {
            snippets.push(self.snippet(def, scratch.path())?);
        }
        Ok(render_file(
            &snippets,
            &self.config.emit,
            self.toolchain.target(),
            &self.table,
        ))
    }

    /// Synthesize, compile and inspect every variant of `def`.
    pub fn snippet(&self, def: &SnippetDef, dir: &Path) -> GenResult<SnippetTemplates> {
        let synth = synthesize(def, self.toolchain.target(), &self.table)?;
        let captured: Vec<GenResult<CapturedCode>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..synth.variants())
                .map(|variant| {
                    let synth = &synth;
                    scope.spawn(move || self.variant(def, synth, variant, dir))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });
        let captured = captured.into_iter().collect::<GenResult<Vec<_>>>()?;
        SnippetTemplates::build(def, synth.representative(), &captured)
    }

    fn variant(
        &self,
        def: &SnippetDef,
        synth: &SynthesizedSnippet,
        variant: usize,
        dir: &Path,
    ) -> GenResult<CapturedCode> {
        let at = VariantKey::new(def.name, variant);
        let stem = format!("{}.{variant}", def.name);
        let c_file = dir.join(format!("{stem}.c"));
        let ir_file = dir.join(format!("{stem}.ll"));
        let ghc_file = dir.join(format!("{stem}.ghc.ll"));
        let obj_file = dir.join(format!("{stem}.{}", self.toolchain.target().object_extension()));

        fs::write(&c_file, synth.source(variant)).map_err(io_error(&at, &c_file))?;
        self.toolchain.emit_ir(&c_file, &ir_file, &at)?;

        let ir = fs::read_to_string(&ir_file).map_err(io_error(&at, &ir_file))?;
        let ctx = RewriteContext {
            at: &at,
            continuations: def.continuations,
            pin: def.pin,
            table: &self.table,
        };
        let rewritten = self.rewriter.rewrite(&ir, &ctx)?;
        fs::write(&ghc_file, rewritten).map_err(io_error(&at, &ghc_file))?;

        self.toolchain.compile_ir(&ghc_file, &obj_file, def.model, &at)?;
        inspect_file(&obj_file, &at, &Declarations::of(def))
    }
}

/// Run the pipeline over `registry` and return the generated source.
pub fn generate(
    registry: &[SnippetDef],
    toolchain: &dyn Toolchain,
    rewriter: &dyn ConventionRewriter,
    config: &GenConfig,
) -> GenResult<String> {
    Generator::new(toolchain, rewriter, config).run(registry)
}

/// Write `contents` to `path` atomically.
pub fn write_artifact(path: &Path, contents: &str) -> io::Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(parent)?;
    file.write_all(contents.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snippet::registry;

    #[test]
    fn only_filters_in_registry_order() {
        let config = GenConfig {
            only: vec!["return".to_string(), "add".to_string()],
            ..GenConfig::default()
        };
        let names: Vec<_> = select(registry::builtin(), &config)
            .unwrap()
            .iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["add", "return"]);
    }

    #[test]
    fn unknown_snippet_is_rejected() {
        let config = GenConfig {
            only: vec!["frobnicate".to_string()],
            ..GenConfig::default()
        };
        let err = select(registry::builtin(), &config).unwrap_err();
        assert_eq!(err.variant_key().snippet, "frobnicate");
    }

    #[test]
    fn artifact_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snippets.rs");
        fs::write(&path, "old").unwrap();
        write_artifact(&path, "new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
