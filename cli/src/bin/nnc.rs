//! `nnc` compiles an NN source file (and everything it imports) and
//! prints diagnostics. Exit codes: 0 on success, 1 if any error diagnostic
//! was emitted, 2 on I/O failure.

#![deny(clippy::all)]

use nn::{BuildError, Session};
use std::path::PathBuf;
use std::process;
use structopt::StructOpt;

/// NN compiler: source text in, diagnostics (and optionally IR) out
#[derive(Debug, StructOpt)]
#[structopt(name = "nnc")]
struct Opt {
    /// Path to the source file
    #[structopt(parse(from_os_str))]
    source: PathBuf,

    /// Print the lowered IR of every compiled module
    #[structopt(long = "emit-ir")]
    emit_ir: bool,
}

fn run(opt: Opt) -> i32 {
    let mut session = Session::new();
    match session.compile_file(&opt.source) {
        Ok(output) => {
            if opt.emit_ir {
                for (module, ir) in &output.modules {
                    println!("; {}", session.registry.get(*module).name);
                    print!("{}", ir);
                }
            }
            0
        }
        Err(BuildError::Io(error)) => {
            eprintln!("nnc: {}: {}", opt.source.display(), error);
            2
        }
        Err(BuildError::Compile(failures)) => {
            for failure in &failures {
                eprintln!("{:#}", failure);
            }
            1
        }
    }
}

fn main() {
    env_logger::init();
    let exit_code = run(Opt::from_args());
    process::exit(exit_code);
}
