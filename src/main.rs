use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use hek::ast::Statement;
use hek::builtins;
use hek::bytecode;
use hek::lexer::{LexError, Tokenizer};
use hek::lower::{Analyzer, Instruction};
use hek::parser::{ParseError, Parser};
use hek::scope::ScopeRef;
use hek::token::Token;
use hek::value::Value;
use hek::vm::Interpreter;

struct Options {
    file: Option<PathBuf>,
    use_repl: bool,
    dump_code: bool,
    script_args: Vec<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Options> {
    let mut options = Options {
        file: None,
        use_repl: false,
        dump_code: false,
        script_args: Vec::new(),
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-i" => options.use_repl = true,
            "--dump-code" => options.dump_code = true,
            "--" => {
                options.script_args.extend(args.by_ref());
                break;
            }
            _ if arg.starts_with('-') => bail!("Unknown argument {arg}"),
            _ => {
                if options.file.is_some() {
                    bail!("Only one input file is supported");
                }
                options.file = Some(PathBuf::from(arg));
            }
        }
    }
    if options.file.is_none() && !options.use_repl {
        bail!("Pass a filename and/or -i to open the REPL");
    }
    Ok(options)
}

fn main() {
    let options = match parse_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };
    let code = match run(&options) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            let frontend = err.downcast_ref::<ParseError>().is_some()
                || err.downcast_ref::<LexError>().is_some();
            if frontend {
                1
            } else {
                -1
            }
        }
    };
    let _ = std::io::stdout().flush();
    std::process::exit(code);
}

fn run(options: &Options) -> Result<i32> {
    let cx = builtins::create_global_scope();
    let mut tok = Tokenizer::new(String::new());
    let mut exit_code = 0;

    if let Some(file) = &options.file {
        if file.extension().and_then(|e| e.to_str()) == Some("bcc") {
            run_bytecode(file, &cx, options.dump_code)?;
        } else {
            load_file(&mut tok, &cx, file, options.dump_code)?;
        }
        if cx.borrow().bindings.contains_key("start") {
            exit_code = invoke_start(&cx, file, &options.script_args)?;
        }
    }

    if options.use_repl {
        repl(&mut tok, &cx, options.file.as_deref())?;
    }

    Ok(exit_code)
}

/// Loads a source file statement by statement against the global scope.
fn load_file(tok: &mut Tokenizer, cx: &ScopeRef, path: &Path, dump_code: bool) -> Result<()> {
    let source =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    tok.reset(source);
    let root = path.parent().map(Path::to_path_buf).unwrap_or_default();

    while !tok.peek()?.is_eof() {
        let statement = match Parser::new(tok).next_stmt() {
            Ok(statement) => statement,
            Err(err) => {
                let detail = describe_parse_error(&err, tok);
                return Err(anyhow::Error::new(err)
                    .context(format!("Parse error in {}: {detail}", path.display())));
            }
        };
        let code = Analyzer::new(&tok.identifiers, &root).analyze(&statement)?;
        if dump_code {
            for instruction in &code {
                println!("{instruction}");
            }
        }
        Interpreter::new(Rc::clone(cx), code).run()?;
    }
    Ok(())
}

fn run_bytecode(path: &Path, cx: &ScopeRef, dump_code: bool) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    let code = bytecode::decode(&bytes).with_context(|| format!("Decoding {}", path.display()))?;
    if dump_code {
        for instruction in &code {
            println!("{instruction}");
        }
    }
    let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Interpreter::new(Rc::clone(cx), code)
        .with_bytecode_root(root)
        .run()?;
    Ok(())
}

/// Calls the script's `start` binding with the program path followed by the
/// post-`--` arguments. An integer return value becomes the exit code.
fn invoke_start(cx: &ScopeRef, program: &Path, args: &[String]) -> Result<i32> {
    let mut values = vec![Value::str(program.display().to_string())];
    values.extend(args.iter().map(|arg| Value::str(arg.clone())));
    let code = vec![
        Instruction::Literal(Value::list(values)),
        Instruction::GetBinding("start".to_string()),
        Instruction::Call(1),
    ];
    let result = Interpreter::new(Rc::clone(cx), code).run()?;
    Ok(match result {
        Some(Value::Int(code)) => code as i32,
        _ => 0,
    })
}

/// Interactive loop: each line is parsed as an expression, lowered as
/// `return <expr>` and evaluated against the persistent global scope.
/// `!r` reloads the source file.
fn repl(tok: &mut Tokenizer, cx: &ScopeRef, file: Option<&Path>) -> Result<()> {
    let mut editor = DefaultEditor::new().context("Opening line editor")?;
    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => bail!("Reading input: {err}"),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        if line == "!r" {
            if let Some(file) = file {
                if let Err(err) = load_file(tok, cx, file, false) {
                    eprintln!("error: {err:#}");
                }
            }
            continue;
        }

        tok.reset(line.to_string());
        let expression = match Parser::new(tok).next_expr() {
            Ok(expression) => expression,
            Err(err) => {
                eprintln!("parse error: {}", describe_parse_error(&err, tok));
                continue;
            }
        };
        let root = std::env::current_dir().unwrap_or_default();
        let code = match Analyzer::new(&tok.identifiers, root)
            .analyze(&Statement::Return(Some(expression)))
        {
            Ok(code) => code,
            Err(err) => {
                eprintln!("error: {err:#}");
                continue;
            }
        };
        match Interpreter::new(Rc::clone(cx), code).run() {
            Ok(Some(value)) => println!("= {value}"),
            Ok(None) => println!("= ()"),
            Err(err) => eprintln!("error: {err:#}"),
        }
    }
    Ok(())
}

/// Renders a parse error with the offending token resolved through the
/// tokenizer's interning tables.
fn describe_parse_error(err: &ParseError, tok: &Tokenizer) -> String {
    match err {
        ParseError::Lex(err) => err.to_string(),
        ParseError::Unexpected {
            expected,
            token,
            line,
        } => format!(
            "Expected {expected}, got {} at line {line}",
            describe_token(*token, tok)
        ),
    }
}

fn describe_token(token: Token, tok: &Tokenizer) -> String {
    match token {
        Token::Identifier(id) => format!("identifier '{}'", tok.identifier(id)),
        Token::Keyword(keyword) => format!("keyword '{}'", keyword.name()),
        Token::Str(id) => format!("string \"{}\"", tok.string_literal(id)),
        Token::Op(op) => format!("operator '{}'", op.symbol()),
        Token::Number(value) => format!("number {value}"),
        Token::Symbol(symbol) => format!("symbol {symbol:?}"),
        Token::Eof => "end of input".to_string(),
    }
}
