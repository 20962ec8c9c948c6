//! `slzprogc` -- the slzprog compiler driver CLI.
//!
//! Provides the `build` subcommand: loads a JSON AST, retrocycles,
//! lowers it to SSA, emits NASM assembly, assembles it through an
//! external assembler, and wraps the result in a PE32 executable.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::info;

use slzprog_codegen::{assemble, emit_function, CodegenError};
use slzprog_core::ast::{Ast, RawNode};
use slzprog_core::error::{AstError, LowerError};
use slzprog_core::lower::lower_program;
use slzprog_pe::{write_pe, PeError, PeInput};

/// The slzprog compiler and tools.
#[derive(Parser)]
#[command(name = "slzprogc", about = "slzprog compiler driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a JSON AST program into a native PE32 executable.
    Build {
        /// Path to the input JSON AST file.
        #[arg(long)]
        input: PathBuf,

        /// Path to write the output `.exe` to.
        #[arg(long)]
        output: PathBuf,

        /// Path to the external assembler binary.
        #[arg(long, default_value = "nasm")]
        assembler: String,

        /// Keep the intermediate `.asm`/`.bin` files next to the output.
        #[arg(long, default_value_t = false)]
        keep_intermediates: bool,

        /// Entry-point subroutine name.
        #[arg(long, default_value = "main")]
        entry: String,
    },
}

/// Build configuration, constructible directly or via the `clap` surface.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub assembler: String,
    pub keep_intermediates: bool,
    pub entry: String,
}

impl Default for CompileOptions {
    fn default() -> CompileOptions {
        CompileOptions {
            input: PathBuf::new(),
            output: PathBuf::new(),
            assembler: "nasm".to_string(),
            keep_intermediates: false,
            entry: "main".to_string(),
        }
    }
}

/// The unified driver error: the only place in the crate where every
/// lower crate's error family is wrapped into one matchable type.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Ast(#[from] AstError),

    #[error(transparent)]
    Lower(#[from] LowerError),

    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error(transparent)]
    Pe(#[from] PeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            input,
            output,
            assembler,
            keep_intermediates,
            entry,
        } => {
            let options = CompileOptions {
                input,
                output,
                assembler,
                keep_intermediates,
                entry,
            };
            process::exit(run_build(&options));
        }
    }
}

/// Runs the full build pipeline and returns the process exit code:
/// 0 success, 1 schema/loader error, 2 lowering error,
/// 3 assembler/codegen error, 4 PE-writer error, 5 I/O error.
fn run_build(options: &CompileOptions) -> i32 {
    match build(options) {
        Ok(()) => {
            info!(output = %options.output.display(), "build succeeded");
            0
        }
        Err(DriverError::Ast(e)) => {
            eprintln!("schema/loader error: {e}");
            1
        }
        Err(DriverError::Lower(e)) => {
            eprintln!("lowering error: {e}");
            2
        }
        Err(DriverError::Codegen(e)) => {
            eprintln!("assembler/codegen error: {e}");
            3
        }
        Err(DriverError::Pe(e)) => {
            eprintln!("PE writer error: {e}");
            4
        }
        Err(DriverError::Io(e)) => {
            eprintln!("I/O error: {e}");
            5
        }
    }
}

fn build(options: &CompileOptions) -> Result<(), DriverError> {
    let text = std::fs::read_to_string(&options.input)?;
    let raw = RawNode::from_json(&text)?;
    let mut ast = Ast::load(&raw)?;
    ast.retrocycle()?;

    let mut func = lower_program(&ast, options.entry.clone())?;
    info!(entry = %options.entry, instrs = func.len(), "lowered program");

    let asm = emit_function(&mut func)?;

    let debug_path = options.keep_intermediates.then(|| options.output.clone());
    let code = assemble(
        &asm,
        &options.assembler,
        options.keep_intermediates,
        debug_path.as_deref(),
    )?;
    info!(bytes = code.len(), "assembled machine code");

    let pe_input = PeInput {
        code,
        ..PeInput::default()
    };
    let image = write_pe(&pe_input)?;

    std::fs::write(&options.output, image)?;
    Ok(())
}
