//! Command-line driver: compile one entry function from textual IR into a
//! relocatable object, optionally linking it into a shared library.

use std::fs;
use std::path::PathBuf;

use bumpalo::Bump;
use clap::{Parser, ValueEnum};

use freestand::core::{CompilationContext, CompileOptions, DebugDetail, UnresolvedPolicy};
use freestand::frontend::{EntrySignature, TextualFrontend};
use freestand::ir::{Cursor, Type};
use freestand::pipeline;
use freestand::toolchain::ExternalLinker;

/// freestand - compile front-end IR into a freestanding ELF object
#[derive(Debug, Parser)]
#[command(name = "freestand", version, about, long_about = None)]
struct Cli {
    /// IR sources. The first holds the entry function, the rest are
    /// subroutine modules.
    #[arg(value_name = "FILE", required = true)]
    inputs: Vec<PathBuf>,

    /// Name the entry function is exported under.
    #[arg(short, long)]
    entry: String,

    /// Entry parameter types, comma separated (e.g. i64,ptr).
    #[arg(long, value_delimiter = ',', value_parser = parse_type)]
    params: Vec<Type>,

    /// Entry return type.
    #[arg(long, default_value = "void", value_parser = parse_type)]
    ret: Type,

    /// Object file to write. Defaults to `<entry>.o`.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep addresses nothing can resolve instead of failing.
    #[arg(long)]
    allow_unresolved: bool,

    /// How duplicate subroutine definitions are linked.
    #[arg(long, value_enum, default_value_t = Detail::Minimal)]
    debug_detail: Detail,

    /// Skip the optimization passes.
    #[arg(long)]
    no_opt: bool,

    /// Print the final IR to stdout.
    #[arg(long)]
    emit_ir: bool,

    /// Link the object into this shared library.
    #[arg(long, value_name = "OUT")]
    link: Option<PathBuf>,

    /// Linker driver used with --link.
    #[arg(long, default_value = "cc", requires = "link")]
    linker: String,

    /// Print compilation statistics to stderr.
    #[arg(long)]
    stats: bool,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Detail {
    Minimal,
    Full,
}

fn parse_type(text: &str) -> Result<Type, String> {
    let mut cursor = Cursor::new(text.trim());
    let ty = cursor.read_type().map_err(|e| e.to_string())?;
    cursor.expect_line_end().map_err(|e| e.to_string())?;
    Ok(ty)
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut frontend = TextualFrontend::new();
    for input in &cli.inputs {
        let text = fs::read_to_string(input)?;
        let name = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.display().to_string());
        frontend.add_source(&name, &text)?;
    }

    let options = CompileOptions {
        unresolved: if cli.allow_unresolved {
            UnresolvedPolicy::Warn
        } else {
            UnresolvedPolicy::Fail
        },
        debug_detail: match cli.debug_detail {
            Detail::Minimal => DebugDetail::Minimal,
            Detail::Full => DebugDetail::Full,
        },
        optimize: !cli.no_opt,
        ..CompileOptions::default()
    };
    let arena = Bump::new();
    let ctx = CompilationContext::with_options(&arena, options);
    let signature = EntrySignature::new(cli.entry.as_str(), cli.params.clone(), cli.ret);

    let unit = pipeline::compile(&ctx, &frontend, &signature)?;

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.o", unit.entry)));
    fs::write(&output, &unit.object)?;
    log::info!("wrote {} ({} bytes)", output.display(), unit.object.len());

    if cli.emit_ir {
        print!("{}", unit.module);
    }

    if let Some(library) = &cli.link {
        ExternalLinker::new(cli.linker.as_str())
            .arg("-shared")
            .link(&output, library)?;
    }

    if cli.stats {
        eprint!("{}", unit.stats);
        eprint!("{}", unit.link_plan);
        eprintln!("Relocations:");
        for (address, entry) in &unit.relocations {
            eprintln!("  {address:#x} -> {entry}");
        }
        for slot in &unit.slots {
            eprintln!("  slot {} ({:#x}) = {}", slot.name, slot.address, slot.root);
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("freestand", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
