// This binary runs the snippet generator over the built-in registry. With no arguments it uses
// clang from PATH, targets the host object format and writes snippets.rs into the current
// directory. The command line only fills in a GenConfig; everything else happens in the
// library. Logging goes through env_logger: -v raises the level to debug (-vv to trace), -q
// lowers it to errors only, and RUST_LOG overrides both. Any generation error is logged with
// the snippet and variant it was raised for and the process exits with status 1.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;

use snipgen::core::{EmitConfig, GenConfig, TargetFormat, ToolchainConfig};
use snipgen::pipeline::{generate, write_artifact};
use snipgen::snippet::registry;
use snipgen::toolchain::Clang;
use snipgen::transform::{ConventionRewriter, TextualRewriter};

#[derive(Parser, Debug)]
#[command(name = "snipgen", version, about = "Generate copy-and-patch stamping routines")]
struct Options {
    /// File the generated Rust source is written to.
    #[arg(short, long, default_value = "snippets.rs")]
    output: PathBuf,

    /// clang executable.
    #[arg(long, env = "SNIPGEN_CLANG", default_value = "clang")]
    clang: PathBuf,

    /// Object format to compile for; defaults to the host's.
    #[arg(long, value_enum)]
    target: Option<TargetFormat>,

    /// Directory for intermediate files; kept after the run.
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Keep the temporary directory of intermediate files.
    #[arg(long)]
    keep_temps: bool,

    /// Module path generated code imports `CodeBuffer` and `Cont` from.
    #[arg(long, default_value = "snipgen::stamp")]
    runtime_path: String,

    /// Only generate these snippets.
    #[arg(long, value_name = "SNIPPET")]
    only: Vec<String>,

    /// Use the structured LLVM rewriter instead of textual substitution.
    #[cfg(feature = "llvm")]
    #[arg(long)]
    structured: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Options {
    fn log_level(&self) -> LevelFilter {
        match (self.quiet, self.verbose) {
            (true, _) => LevelFilter::Error,
            (false, 0) => LevelFilter::Info,
            (false, 1) => LevelFilter::Debug,
            (false, _) => LevelFilter::Trace,
        }
    }

    fn config(&self) -> GenConfig {
        GenConfig {
            toolchain: ToolchainConfig {
                clang: self.clang.clone(),
                target: self.target.unwrap_or_else(TargetFormat::host),
                ..ToolchainConfig::default()
            },
            emit: EmitConfig {
                runtime_path: self.runtime_path.clone(),
            },
            work_dir: self.work_dir.clone(),
            keep_temps: self.keep_temps,
            only: self.only.clone(),
        }
    }
}

fn rewriter(options: &Options) -> Box<dyn ConventionRewriter> {
    #[cfg(feature = "llvm")]
    if options.structured {
        return Box::new(snipgen::transform::module::ModuleRewriter);
    }
    let _ = options;
    Box::new(TextualRewriter)
}

fn run(options: &Options) -> snipgen::core::GenResult<String> {
    let config = options.config();
    let clang = Clang::new(&config.toolchain);
    generate(registry::builtin(), &clang, rewriter(options).as_ref(), &config)
}

fn main() -> ExitCode {
    let options = Options::parse();
    env_logger::Builder::new()
        .filter_level(options.log_level())
        .parse_default_env()
        .init();

    let source = match run(&options) {
        Ok(source) => source,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = write_artifact(&options.output, &source) {
        log::error!("writing {}: {e}", options.output.display());
        return ExitCode::FAILURE;
    }
    log::info!("wrote {}", options.output.display());
    ExitCode::SUCCESS
}
