//! `nnasm` assembles a `.nnasm` source file into an executable `.nnep`
//! image. Exit codes: 0 on success, 1 if any error diagnostic was emitted,
//! 2 on I/O failure.

#![deny(clippy::all)]

use anyhow::Context;
use nn::asm::assemble::assemble;
use nn::asm::disasm::disassemble;
use std::fs;
use std::path::PathBuf;
use std::process;
use structopt::StructOpt;

/// NN assembler: dialect text in, executable image out
#[derive(Debug, StructOpt)]
#[structopt(name = "nnasm")]
struct Opt {
    /// Path to the assembly source file
    #[structopt(parse(from_os_str))]
    source: PathBuf,

    /// Where to write the image
    #[structopt(
        parse(from_os_str),
        long = "output",
        short = "o",
        default_value = "out.nnep"
    )]
    output: PathBuf,

    /// Print a disassembly of the produced image
    #[structopt(long = "disassemble")]
    disassemble: bool,
}

fn run(opt: Opt) -> anyhow::Result<i32> {
    let source = fs::read_to_string(&opt.source)
        .with_context(|| format!("failed to read {:?}", opt.source))?;
    let name = opt
        .source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| opt.source.display().to_string());

    let image = match assemble(&source, &name) {
        Ok(image) => image,
        Err(errors) => {
            eprintln!("{:#}", errors);
            return Ok(1);
        }
    };

    fs::write(&opt.output, &image)
        .with_context(|| format!("failed to write {:?}", opt.output))?;
    if opt.disassemble {
        print!("{}", disassemble(&image)?);
    }
    Ok(0)
}

fn main() {
    env_logger::init();
    let exit_code = match run(Opt::from_args()) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("nnasm: {:#}", error);
            2
        }
    };
    process::exit(exit_code);
}
