//! `hek` library crate.
//!
//! High-level layout:
//! - frontend: `lexer` + `parser` produce the AST (`ast`)
//! - `lower` flattens the AST into stack-machine instructions
//! - `vm` executes instructions over the `value`/`scope` runtime model
//! - `bytecode` persists instruction lists; `builtins` is the host stdlib
pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod scope;
pub mod token;
pub mod value;
pub mod vm;

use std::path::Path;
use std::rc::Rc;

use anyhow::Result;

pub use value::Value;

/// Convenience pipeline: lexes, parses, lowers and executes `source`
/// statement by statement against `scope`, rooted at `root` for module
/// resolution. Returns the last statement's result, if any.
pub fn run_source(
    source: &str,
    scope: &scope::ScopeRef,
    root: &Path,
) -> Result<Option<Value>> {
    let mut tok = lexer::Tokenizer::new(source);
    let mut result = None;
    while !tok.peek()?.is_eof() {
        let statement = parser::Parser::new(&mut tok).next_stmt()?;
        let code = lower::Analyzer::new(&tok.identifiers, root).analyze(&statement)?;
        result = vm::Interpreter::new(Rc::clone(scope), code).run()?;
    }
    Ok(result)
}
