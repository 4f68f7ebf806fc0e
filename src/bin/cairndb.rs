//! # CairnDB CLI Entry Point
//!
//! Binary entry point for the CairnDB command-line interface.
//!
//! ## Usage
//!
//! ```bash
//! # Open (or create) a database and drop into the shell
//! cairndb ./app.db
//!
//! # Show version
//! cairndb --version
//! ```
//!
//! Exits 0 on a normal shell exit and 1 when the database cannot be
//! opened.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use cairndb::cli::Repl;
use cairndb::Db;
use eyre::{bail, Result, WrapErr};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let mut db_path: Option<PathBuf> = None;
    for arg in &args[1..] {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--version" | "-v" => {
                println!("cairndb {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other if other.starts_with('-') => {
                bail!("Unknown option: {}", other);
            }
            path => {
                if db_path.is_some() {
                    bail!("Multiple database paths specified");
                }
                db_path = Some(PathBuf::from(path));
            }
        }
    }

    let db_path = match db_path {
        Some(path) => path,
        None => bail!("Usage: cairndb <DATABASE_PATH>"),
    };

    let db = Db::open(&db_path)
        .wrap_err_with(|| format!("failed to open database at {}", db_path.display()))?;

    let mut repl = Repl::new(db)?;
    repl.run()?;

    Ok(())
}

fn print_usage() {
    println!("CairnDB - Embedded transactional key/value store");
    println!();
    println!("USAGE:");
    println!("    cairndb [OPTIONS] <DATABASE_PATH>");
    println!();
    println!("ARGS:");
    println!("    <DATABASE_PATH>    Path to the database file");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help         Print help information");
    println!("    -v, --version      Print version information");
    println!();
    println!("COMMANDS (inside the shell):");
    println!("    get <bucket> <key>    Print the value stored under <key>");
    println!("    scan <bucket>         Dump every page of the bucket's tree");
    println!("    exit                  Leave the shell");
}
