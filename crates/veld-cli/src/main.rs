//! The `veld` compiler driver.
//!
//! Compiles one Veld source file straight to a native executable — no
//! external assembler or linker. Exit code 0 on success, 1 on any
//! compilation error.

mod output;

use anyhow::{bail, Context, Result};
use clap::Parser;
use output::StyledErr;
use std::path::PathBuf;
use std::process::ExitCode;
use veld_asm::{Format, Target};
use veld_codegen::{CompileError, Options};
use veld_parser::diag::ErrorSink;

#[derive(Parser)]
#[command(name = "veld")]
#[command(about = "Compile Veld programs to native executables")]
#[command(version)]
struct Cli {
    /// Source file to compile
    source: PathBuf,

    /// Output file path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target triple (x86_64-linux, aarch64-linux, riscv64-linux,
    /// aarch64-darwin, x86_64-windows); defaults to the host
    #[arg(short, long)]
    target: Option<String>,

    /// Emit detailed progress to standard error
    #[arg(short, long)]
    verbose: bool,

    /// Dump compiler introspection (layout, symbols, allocations) as JSON
    #[arg(long)]
    debug: bool,

    /// Budget in milliseconds for algebraic simplification; 0 disables
    #[arg(long, default_value = "100")]
    opt_timeout: u64,

    /// Wrap the executable in a self-decompressing stub (Linux x86-64)
    #[arg(long)]
    compress: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut err = StyledErr::new();
    match run(&cli, &mut err) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            err.error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, err: &mut StyledErr) -> Result<()> {
    let target = match &cli.target {
        Some(triple) => Target::parse(triple)?,
        None => Target::host(),
    };

    let path = cli.source.display().to_string();
    let source = std::fs::read_to_string(&cli.source)
        .with_context(|| format!("cannot read {path}"))?;

    // Front end: lex, parse, render any syntax errors with carets.
    let mut sink = ErrorSink::default();
    let tokens = match veld_parser::lex(&source) {
        Ok(tokens) => tokens,
        Err(lex_err) => {
            sink.error(
                veld_parser::DiagKind::Syntax,
                lex_err.span,
                "unrecognized token",
            );
            sink.render(&path, &source);
            bail!("1 error");
        }
    };
    let program = match veld_parser::parse(tokens) {
        Ok(program) => program,
        Err(parse_errors) => {
            let count = parse_errors.len();
            for e in parse_errors {
                match e.suggestion {
                    Some(s) => sink.error_with_suggestion(
                        veld_parser::DiagKind::Syntax,
                        e.span,
                        e.message,
                        s,
                    ),
                    None => sink.error(veld_parser::DiagKind::Syntax, e.span, e.message),
                }
            }
            sink.render(&path, &source);
            bail!("{count} error{}", if count == 1 { "" } else { "s" });
        }
    };

    // Back end.
    let options = Options {
        target,
        verbose: cli.verbose,
        debug: cli.debug,
        opt_timeout_ms: cli.opt_timeout,
        compress: cli.compress,
    };
    let artifact = match veld_codegen::compile(&program, &options, &mut sink) {
        Ok(artifact) => artifact,
        Err(CompileError::UserErrors(count)) => {
            sink.render(&path, &source);
            bail!("{count} error{}", if count == 1 { "" } else { "s" });
        }
        Err(fatal) => return Err(fatal.into()),
    };

    if cli.verbose {
        for line in &artifact.log {
            err.note(line);
        }
    }
    if let Some(dump) = &artifact.debug_dump {
        eprintln!("{dump}");
    }

    let out_path = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output(&cli.source, target));
    std::fs::write(&out_path, &artifact.bytes)
        .with_context(|| format!("cannot write {}", out_path.display()))?;
    make_executable(&out_path)?;

    if target.format() == Format::MachO {
        sign_macho(&out_path, err);
    }

    if cli.verbose {
        err.note(&format!(
            "wrote {} ({} bytes, {})",
            out_path.display(),
            artifact.bytes.len(),
            target
        ));
    }
    Ok(())
}

fn default_output(source: &std::path::Path, target: Target) -> PathBuf {
    let stem = source.file_stem().unwrap_or_default();
    let mut out = PathBuf::from(stem);
    if target.format() == Format::Pe {
        out.set_extension("exe");
    }
    out
}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

/// Apple Silicon requires at least an ad-hoc signature; delegate to
/// `ldid -S` when it is installed, warn otherwise.
fn sign_macho(path: &std::path::Path, err: &mut StyledErr) {
    match std::process::Command::new("ldid").arg("-S").arg(path).status() {
        Ok(status) if status.success() => {}
        Ok(status) => err.warn(&format!("ldid -S exited with {status}")),
        Err(_) => err.warn("ldid not found; the binary needs an ad-hoc signature to run"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_names() {
        let t = Target::parse("x86_64-linux").unwrap();
        assert_eq!(
            default_output(std::path::Path::new("demo/hello.veld"), t),
            PathBuf::from("hello")
        );
        let t = Target::parse("x86_64-windows").unwrap();
        assert_eq!(
            default_output(std::path::Path::new("hello.veld"), t),
            PathBuf::from("hello.exe")
        );
    }
}
