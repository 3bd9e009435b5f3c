use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;

use clap::{Parser, Subcommand};
use serde::Serialize;

use blisp::Script;
use blisp::bytecode::{FuncDesc, Op};

#[derive(Parser)]
#[command(name = "blisp", version, about = "Compile and run blisp scripts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile and run a source script
    Run { path: PathBuf },
    /// Run a previously compiled script
    Exec { path: PathBuf },
    /// Compile a source script and write the binary form
    Build {
        path: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Compile a source script and print its bytecode listing as JSON
    Dump { path: PathBuf },
}

#[derive(Serialize)]
struct Listing<'a> {
    code: &'a [Op],
    functions: &'a [FuncDesc],
    natives: Vec<&'a str>,
    strings: Vec<&'a str>,
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { path } => {
            let mut script = open_script(&path);
            run_script(&mut script);
        }
        Command::Exec { path } => {
            let mut script = match Script::load(&path) {
                Ok(s) => s,
                Err(e) => fail(&format!("cannot load {}: {e}", path.display())),
            };
            run_script(&mut script);
        }
        Command::Build { path, output } => {
            let script = open_script(&path);
            if let Err(e) = script.write(&output) {
                fail(&format!("cannot write {}: {e}", output.display()));
            }
        }
        Command::Dump { path } => {
            let script = open_script(&path);
            let listing = Listing {
                code: &script.code,
                functions: &script.funcs,
                natives: script
                    .natives
                    .iter()
                    .map(|n| {
                        script
                            .strings
                            .get(n.name as usize)
                            .map(|s| &**s)
                            .unwrap_or("?")
                    })
                    .collect(),
                strings: script.strings.iter().map(|s| &**s).collect(),
            };
            match serde_json::to_string_pretty(&listing) {
                Ok(json) => println!("{json}"),
                Err(e) => fail(&format!("cannot render listing: {e}")),
            }
        }
    }
}

fn open_script(path: &Path) -> Script {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => fail(&format!("cannot read {}: {e}", path.display())),
    };
    match Script::open_named(&source, &path.display().to_string()) {
        Ok(s) => s,
        Err(e) => fail(&e.to_string()),
    }
}

fn run_script(script: &mut Script) {
    match script.run() {
        Ok(result) => println!("{result}"),
        Err(e) => fail(&format!("runtime error: {e}")),
    }
}

fn fail(message: &str) -> ! {
    eprintln!("{message}");
    exit(1)
}
