//! `nnvm` executes a `.nnep` image. Program output (the write builtin)
//! goes to stdout. Exit codes: 0 for an orderly stop (halt or break), 1
//! for an error trap, 2 on I/O or load failure.

#![deny(clippy::all)]

use anyhow::Context;
use nn::vm::Machine;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use structopt::StructOpt;

/// NN virtual machine: runs executable images
#[derive(Debug, StructOpt)]
#[structopt(name = "nnvm")]
struct Opt {
    /// Path to the image file
    #[structopt(parse(from_os_str))]
    image: PathBuf,

    /// Print the final register state
    #[structopt(long = "registers")]
    registers: bool,

    /// Print the final register state as JSON
    #[structopt(long = "json")]
    json: bool,

    /// Print the memory layout and instruction count
    #[structopt(long = "info")]
    info: bool,
}

fn run(opt: Opt) -> anyhow::Result<i32> {
    let image = fs::read(&opt.image)
        .with_context(|| format!("failed to read {:?}", opt.image))?;
    let mut machine = Machine::load(&image)
        .with_context(|| format!("failed to load {:?}", opt.image))?;

    let trap = machine.run();
    std::io::stdout().write_all(machine.output())?;

    if opt.registers {
        let registers = machine.registers();
        let mut names: Vec<&String> = registers.keys().collect();
        names.sort();
        for name in names {
            eprintln!("{:>3}: {:#x}", name, registers[name]);
        }
    }
    if opt.json {
        println!("{}", serde_json::to_string_pretty(&machine.registers())?);
    }
    if opt.info {
        eprintln!("{}", machine.info());
    }

    if trap.is_error() {
        eprintln!("nnvm: trap: {}", trap);
        Ok(1)
    } else {
        Ok(0)
    }
}

fn main() {
    env_logger::init();
    let exit_code = match run(Opt::from_args()) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("nnvm: {:#}", error);
            2
        }
    };
    process::exit(exit_code);
}
