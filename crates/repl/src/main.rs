//! Opal host: interactive REPL and script runner.
//!
//! Reads source, drives the reader and compiler, and runs each form on a
//! fresh root strand. Multi-line forms work in the REPL because the reader
//! distinguishes "form still open" from a hard parse error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use opal_compiler::{compile, parse_all};
use opal_core::error::OpalError;
use opal_core::ops;
use opal_core::value::Value;
use opal_core::vm::Vm;

#[derive(Parser)]
#[command(name = "opal")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Opal language REPL and script runner", long_about = None)]
struct Cli {
    /// Script to run; interactive REPL when omitted
    script: Option<PathBuf>,

    /// Evaluate an expression and print its result
    #[arg(short = 'e', long = "eval", value_name = "EXPR")]
    eval: Option<String>,

    /// Log filter, e.g. "opal_core::vm=debug" (overrides OPAL_LOG)
    #[arg(long, value_name = "FILTER")]
    log: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(spec) => EnvFilter::new(spec),
        None => EnvFilter::try_from_env("OPAL_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let vm = Vm::new();

    if let Some(expr) = &cli.eval {
        return match run_source(&vm, expr) {
            Ok(value) => {
                println!("{}", ops::describe(value));
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    if let Some(path) = &cli.script {
        let source = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("opal: cannot read {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        };
        return match run_source(&vm, &source) {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    repl(&vm)
}

/// Compile and run every form; the last result wins.
fn run_source(vm: &Vm, source: &str) -> Result<Value, OpalError> {
    opal_compiler::eval(vm, source)
}

fn repl(vm: &Vm) -> ExitCode {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("opal: cannot start line editor: {}", e);
            return ExitCode::FAILURE;
        }
    };
    println!("opal {} — ctrl-d to exit", env!("CARGO_PKG_VERSION"));
    let mut pending = String::new();
    loop {
        let prompt = if pending.is_empty() { "opal> " } else { "....> " };
        match editor.readline(prompt) {
            Ok(line) => {
                pending.push_str(&line);
                pending.push('\n');
                // Keep reading lines while a form is still open.
                match parse_all(vm, &pending) {
                    Err(e) if e.unexpected_eos => continue,
                    Err(e) => {
                        eprintln!("{}", OpalError::from(e));
                        pending.clear();
                        continue;
                    }
                    Ok(forms) => {
                        let _ = editor.add_history_entry(pending.trim_end());
                        pending.clear();
                        for form in forms {
                            match compile(vm, form).and_then(|f| vm.run(f)) {
                                Ok(value) => println!("{}", ops::describe(value)),
                                Err(e) => {
                                    eprintln!("{}", e);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                pending.clear();
            }
            Err(ReadlineError::Eof) => return ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("opal: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_run_source_returns_last_form() {
        let vm = Vm::new();
        let result = run_source(&vm, "(def x 2) (+ x 3)").unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn test_run_source_reports_status() {
        let vm = Vm::new();
        let err = run_source(&vm, "(/ 1 0)").unwrap_err();
        assert_eq!(err.status(), opal_core::error::Status::Runtime);
        let err = run_source(&vm, "(").unwrap_err();
        assert_eq!(err.status(), opal_core::error::Status::Parse);
    }

    #[test]
    fn test_script_file_roundtrip() {
        let vm = Vm::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(def greeting \"hi\")").unwrap();
        writeln!(file, "(length greeting)").unwrap();
        let source = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(run_source(&vm, &source).unwrap(), Value::Int(2));
    }
}
