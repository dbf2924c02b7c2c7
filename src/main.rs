use colored::Colorize;
use rlox::scanner::Scanner;
use rlox::sexpr;
use rlox::token::TokenType;
use rlox::vm::{InterpretError, Vm};
use rustyline::Editor;
use std::{env, fs, process};

const USAGE_MSG: &str = "Usage:
  rlox tokenize <file>   print the token stream
  rlox parse <file>      print the expression as an S-expression
  rlox evaluate <file>   evaluate the file as a single expression
  rlox run <file>        run the program

With no arguments an interactive session starts.";

fn main() {
    let mut args = env::args().skip(1);
    let subcommand = match args.next() {
        Some(subcommand) => subcommand,
        None => {
            repl();
            return;
        }
    };
    match subcommand.as_str() {
        "tokenize" => tokenize(&read_source(&mut args)),
        "parse" => parse(&read_source(&mut args)),
        "evaluate" => evaluate(&read_source(&mut args)),
        "run" => run(&read_source(&mut args)),
        _ => {
            eprintln!("Unknown command: {}", subcommand);
            eprintln!("{}", USAGE_MSG);
            process::exit(exitcode::USAGE);
        }
    }
}

fn read_source(args: &mut impl Iterator<Item = String>) -> String {
    let path = args.next().unwrap_or_else(|| {
        eprintln!("Expected a file path.");
        eprintln!("{}", USAGE_MSG);
        process::exit(exitcode::USAGE);
    });
    if args.next().is_some() {
        eprintln!("Unexpected extra arguments.");
        eprintln!("{}", USAGE_MSG);
        process::exit(exitcode::USAGE);
    }
    fs::read_to_string(&path).unwrap_or_else(|err| {
        eprintln!("Could not read file \"{}\": {}", path, err);
        process::exit(exitcode::IOERR);
    })
}

fn tokenize(source: &str) {
    let mut scanner = Scanner::new(source);
    let mut had_error = false;
    loop {
        let token = scanner.scan_token();
        match token.typ {
            TokenType::Error => {
                eprintln!("[line {}] Error: {}", token.line, token.lexeme);
                had_error = true;
            }
            TokenType::String => {
                let contents = &token.lexeme[1..token.lexeme.len() - 1];
                println!("STRING {} {}", token.lexeme, contents);
            }
            TokenType::Number => {
                let value: f64 = token.lexeme.parse().unwrap_or(0.0);
                println!("NUMBER {} {}", token.lexeme, sexpr::render_number(value));
            }
            TokenType::Eof => {
                println!("EOF  null");
                break;
            }
            _ => println!("{} {} null", token.typ, token.lexeme),
        }
    }
    if had_error {
        process::exit(exitcode::DATAERR);
    }
}

fn parse(source: &str) {
    match sexpr::parse_expression(source) {
        Ok(tree) => println!("{}", tree),
        Err(()) => process::exit(exitcode::DATAERR),
    }
}

fn evaluate(source: &str) {
    let mut vm = Vm::new();
    exit_on_error(vm.interpret_expression(source));
}

fn run(source: &str) {
    let mut vm = Vm::new();
    exit_on_error(vm.interpret(source));
}

fn exit_on_error(result: Result<(), InterpretError>) {
    match result {
        Ok(()) => {}
        Err(InterpretError::Compile) => process::exit(exitcode::DATAERR),
        Err(InterpretError::Runtime) => process::exit(exitcode::SOFTWARE),
    }
}

fn repl() {
    println!(
        "{} {}",
        env!("CARGO_PKG_NAME").bold(),
        env!("CARGO_PKG_VERSION")
    );
    let mut rl = Editor::<()>::new();
    // one VM for the whole session: globals and interned strings persist
    let mut vm = Vm::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                let _ = vm.interpret(&line);
            }
            Err(_) => break,
        }
    }
}
