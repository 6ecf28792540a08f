use std::env;
use std::fs;
use std::process::ExitCode;

use loxc::gc::ActiveGC;
use loxc::prelude::*;

fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("Usage: loxc <script> [debug-level]");
            return ExitCode::FAILURE;
        }
    };
    let debug_level: u8 = args
        .next()
        .map(|level| level.parse().expect("debug level must be 0-3"))
        .unwrap_or(0);

    let source = match fs::read_to_string(&path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read {path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let gc = ActiveGC::install();
    match compile(&source, &gc, debug_level) {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
