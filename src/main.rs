//! Oryx CLI: run scripts, format source, start the REPL.
//!
//! Exit codes for `run`: the script's integer result in 0..=255, 1 on a
//! script error, 2 on an I/O error. No flags; no environment variables.

use oryx::bytecode;
use oryx::error::OryxError;
use std::path::Path;
use std::process::ExitCode;

enum Command {
    Run { file: String },
    Fmt { file: String },
    Repl,
    Help,
    DebugDump { file: String },
    DebugTokens { file: String },
    DebugWrite { file: String, out: String },
    DebugRead { file: String },
}

fn print_usage() {
    eprintln!("Oryx {} - a small scripting language", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: oryx                   start the REPL");
    eprintln!("       oryx run <file>        run a script (.ox) or module (.oxb)");
    eprintln!("       oryx fmt <file>        format a source file");
    eprintln!("       oryx help              show this help");
    if cfg!(debug_assertions) {
        eprintln!();
        eprintln!("Debug commands:");
        eprintln!("       oryx debug:dump <file>         disassemble a script");
        eprintln!("       oryx debug:tokens <file>       dump the token stream");
        eprintln!("       oryx debug:write <file> <out>  compile to a .oxb module");
        eprintln!("       oryx debug:read <file>         load and disassemble a .oxb module");
    }
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let Some(first) = args.first() else {
        return Ok(Command::Repl);
    };
    match first.as_str() {
        "run" => match args.get(1) {
            Some(file) => Ok(Command::Run { file: file.clone() }),
            None => Err("'run' needs a file argument".to_string()),
        },
        "fmt" => match args.get(1) {
            Some(file) => Ok(Command::Fmt { file: file.clone() }),
            None => Err("'fmt' needs a file argument".to_string()),
        },
        "help" => Ok(Command::Help),
        "debug:dump" if cfg!(debug_assertions) => match args.get(1) {
            Some(file) => Ok(Command::DebugDump { file: file.clone() }),
            None => Err("'debug:dump' needs a file argument".to_string()),
        },
        "debug:tokens" if cfg!(debug_assertions) => match args.get(1) {
            Some(file) => Ok(Command::DebugTokens { file: file.clone() }),
            None => Err("'debug:tokens' needs a file argument".to_string()),
        },
        "debug:write" if cfg!(debug_assertions) => match (args.get(1), args.get(2)) {
            (Some(file), Some(out)) => Ok(Command::DebugWrite {
                file: file.clone(),
                out: out.clone(),
            }),
            _ => Err("'debug:write' needs <file> and <out> arguments".to_string()),
        },
        "debug:read" if cfg!(debug_assertions) => match args.get(1) {
            Some(file) => Ok(Command::DebugRead { file: file.clone() }),
            None => Err("'debug:read' needs a file argument".to_string()),
        },
        other => Err(format!("Unknown command '{}'", other)),
    }
}

fn exit_code_for(err: &OryxError) -> u8 {
    match err {
        OryxError::Io(_) => 2,
        _ => 1,
    }
}

fn run(file: &str) -> ExitCode {
    match oryx::run_file(Path::new(file)) {
        Ok(outcome) => ExitCode::from(outcome.exit_code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn fmt(file: &str) -> ExitCode {
    let source = match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Cannot read {}: {}", file, e);
            return ExitCode::from(2);
        }
    };
    match oryx::format_source(&source) {
        Ok(formatted) => {
            print!("{}", formatted);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(1)
        }
    }
}

fn debug_dump(file: &str) -> ExitCode {
    let result = (|| -> Result<String, OryxError> {
        let source = std::fs::read_to_string(file)?;
        let module = oryx::compile_source(file, &source)?;
        bytecode::verify_module(&module)
            .map_err(|e| oryx::error::RuntimeError::new(e.to_string()))?;
        Ok(bytecode::disassemble_module(&module))
    })();
    match result {
        Ok(dump) => {
            print!("{}", dump);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn debug_tokens(file: &str) -> ExitCode {
    let source = match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Cannot read {}: {}", file, e);
            return ExitCode::from(2);
        }
    };
    match oryx::lexer::Scanner::new(&source).scan_tokens() {
        Ok(tokens) => {
            for token in tokens {
                println!("{:<6} {}", token.span.start, token.kind);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(1)
        }
    }
}

fn debug_write(file: &str, out: &str) -> ExitCode {
    let result = (|| -> Result<(), OryxError> {
        let source = std::fs::read_to_string(file)?;
        let module = oryx::compile_source(file, &source)?;
        let bytes = bytecode::to_bytes(&module)?;
        std::fs::write(out, bytes)?;
        Ok(())
    })();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn debug_read(file: &str) -> ExitCode {
    let result = (|| -> Result<String, OryxError> {
        let bytes = std::fs::read(file)?;
        let module = bytecode::from_bytes(&bytes)?;
        Ok(bytecode::disassemble_module(&module))
    })();
    match result {
        Ok(dump) => {
            print!("{}", dump);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_command(&args) {
        Ok(Command::Repl) => match oryx::repl::run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::from(2)
            }
        },
        Ok(Command::Run { file }) => run(&file),
        Ok(Command::Fmt { file }) => fmt(&file),
        Ok(Command::Help) => {
            print_usage();
            ExitCode::SUCCESS
        }
        Ok(Command::DebugDump { file }) => debug_dump(&file),
        Ok(Command::DebugTokens { file }) => debug_tokens(&file),
        Ok(Command::DebugWrite { file, out }) => debug_write(&file, out.as_str()),
        Ok(Command::DebugRead { file }) => debug_read(&file),
        Err(message) => {
            eprintln!("{}", message);
            eprintln!();
            print_usage();
            ExitCode::from(2)
        }
    }
}
