//! # REPL - Read-Eval-Print Loop
//!
//! The main interactive loop for the CairnDB CLI. Handles:
//!
//! - Reading input with rustyline (history, line editing)
//! - Dispatching the `get`, `scan`, `exit`, and `help` commands
//! - Printing values and page dumps
//!
//! Command errors are displayed but do not terminate the REPL. History
//! lives in memory only; the shell reads no environment and writes no
//! dotfiles.

use eyre::{Result, WrapErr};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::error::Error;
use crate::Db;

const PROMPT: &str = "cairn> ";

pub struct Repl {
    db: Db,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new(db: Db) -> Result<Self> {
        let editor = DefaultEditor::new().wrap_err("failed to initialize line editor")?;
        Ok(Self { db, editor })
    }

    pub fn run(&mut self) -> Result<()> {
        self.print_welcome();

        loop {
            match self.editor.readline(PROMPT) {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    self.editor.add_history_entry(trimmed).ok();
                    if !self.handle_line(trimmed) {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                }
                Err(ReadlineError::Eof) => {
                    println!("Bye");
                    break;
                }
                Err(err) => {
                    eprintln!("Error reading input: {}", err);
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");

        match command {
            "exit" | "quit" => return false,
            "help" => self.print_help(),
            "get" => {
                let (bucket, key) = (parts.next(), parts.next());
                match (bucket, key) {
                    (Some(bucket), Some(key)) => self.cmd_get(bucket, key),
                    _ => println!("Usage: get <bucket> <key>"),
                }
            }
            "scan" => match parts.next() {
                Some(bucket) => self.cmd_scan(bucket),
                None => println!("Usage: scan <bucket>"),
            },
            _ => println!("Unknown command. Supported: get, scan, exit"),
        }
        true
    }

    fn cmd_get(&self, bucket: &str, key: &str) {
        let result = self.db.view(|tx| {
            let b = tx.bucket(bucket)?;
            match b.get(key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("Key not found"),
            }
            Ok(())
        });

        match result {
            Ok(()) => {}
            Err(Error::BucketNotFound(_)) => println!("Bucket not found"),
            Err(err) => eprintln!("Error: {}", err),
        }
    }

    fn cmd_scan(&self, bucket: &str) {
        match self.db.debug_bucket_pages(bucket) {
            Ok(rendering) => print!("{}", rendering),
            Err(Error::BucketNotFound(_)) => println!("Bucket not found"),
            Err(err) => eprintln!("Error: {}", err),
        }
    }

    fn print_welcome(&self) {
        println!("CairnDB version {}", env!("CARGO_PKG_VERSION"));
        println!("Enter \"help\" for usage hints.");
        println!("Connected to: {}", self.db.path().display());
        println!();
    }

    fn print_help(&self) {
        println!("Commands:");
        println!("    get <bucket> <key>    Print the value stored under <key>");
        println!("    scan <bucket>         Dump every page of the bucket's tree");
        println!("    help                  Show this help");
        println!("    exit                  Leave the shell");
    }
}
