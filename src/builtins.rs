//! Host-provided standard library.
//!
//! Every binding is an ordinary function value whose body is a single
//! `system` instruction; the callback reads its arguments from the call
//! frame's parameter bindings and pushes its result onto the caller's
//! stack. The `str`, `list`, `map` and `file` groups are published as
//! modules of the global scope.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, Result};

use crate::lower::{Instruction, SystemFn};
use crate::scope::{self, Scope, ScopeRef};
use crate::value::{FileHandle, FnValue, Value};
use crate::vm::Interpreter;

fn mk_sys_fn(params: &[&str], f: impl Fn(&mut Interpreter) -> Result<()> + 'static) -> Value {
    Value::Fn(Rc::new(FnValue {
        name: None,
        params: params.iter().map(|param| param.to_string()).collect(),
        body: Rc::new(vec![Instruction::System(SystemFn(Rc::new(f)))]),
        closure: None,
    }))
}

fn arg(intp: &Interpreter, name: &str) -> Result<Value> {
    scope::lookup(&intp.current_scope, name)
}

pub fn create_global_scope() -> ScopeRef {
    let cx = Scope::root();
    {
        let mut root = cx.borrow_mut();
        root.bind("nil", Value::Nil);

        root.bind(
            "print",
            mk_sys_fn(&["str"], |intp| {
                let text = arg(intp, "str")?.as_str()?;
                print!("{}", text.borrow());
                Ok(())
            }),
        );
        root.bind(
            "println",
            mk_sys_fn(&["str"], |intp| {
                let text = arg(intp, "str")?.as_str()?;
                println!("{}", text.borrow());
                Ok(())
            }),
        );
        root.bind(
            "printv",
            mk_sys_fn(&["val"], |intp| {
                print!("{}", arg(intp, "val")?);
                Ok(())
            }),
        );
        root.bind(
            "error",
            mk_sys_fn(&["msg"], |intp| {
                let message = arg(intp, "msg")?.as_str()?;
                bail!("{}", message.borrow());
            }),
        );

        root.modules.insert("str".to_string(), build_str_api());
        root.modules.insert("list".to_string(), build_list_api());
        root.modules.insert("map".to_string(), build_map_api());
        root.modules.insert("file".to_string(), build_file_api());
    }
    cx
}

fn build_str_api() -> ScopeRef {
    let module = Scope::root();
    {
        let mut module = module.borrow_mut();
        module.bind(
            "length",
            mk_sys_fn(&["str"], |intp| {
                let text = arg(intp, "str")?.as_str()?;
                let length = text.borrow().chars().count() as i64;
                intp.stack.push(Value::Int(length));
                Ok(())
            }),
        );
        module.bind(
            "concat",
            mk_sys_fn(&["a", "b"], |intp| {
                let a = arg(intp, "a")?.as_str()?;
                let b = arg(intp, "b")?.as_str()?;
                let joined = format!("{}{}", a.borrow(), b.borrow());
                intp.stack.push(Value::str(joined));
                Ok(())
            }),
        );
        module.bind(
            "append",
            mk_sys_fn(&["str", "char"], |intp| {
                let text = arg(intp, "str")?;
                let code = arg(intp, "char")?.as_int()?;
                let ch = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| anyhow::anyhow!("Invalid character code {code}"))?;
                text.as_str()?.borrow_mut().push(ch);
                intp.stack.push(text);
                Ok(())
            }),
        );
        module.bind(
            "to",
            mk_sys_fn(&["val"], |intp| {
                let rendered = arg(intp, "val")?.to_text();
                intp.stack.push(Value::str(rendered));
                Ok(())
            }),
        );
    }
    module
}

fn build_list_api() -> ScopeRef {
    let module = Scope::root();
    {
        let mut module = module.borrow_mut();
        module.bind(
            "length",
            mk_sys_fn(&["lst"], |intp| {
                let list = arg(intp, "lst")?.as_list()?;
                let length = list.borrow().len() as i64;
                intp.stack.push(Value::Int(length));
                Ok(())
            }),
        );
        module.bind(
            "concat",
            mk_sys_fn(&["a", "b"], |intp| {
                let a = arg(intp, "a")?.as_list()?;
                let b = arg(intp, "b")?.as_list()?;
                let mut joined = a.borrow().clone();
                joined.extend(b.borrow().iter().cloned());
                intp.stack.push(Value::list(joined));
                Ok(())
            }),
        );
        module.bind(
            "append",
            mk_sys_fn(&["lst", "x"], |intp| {
                let list = arg(intp, "lst")?;
                let value = arg(intp, "x")?;
                list.as_list()?.borrow_mut().push(value);
                intp.stack.push(list);
                Ok(())
            }),
        );
        module.bind(
            "pop",
            mk_sys_fn(&["lst"], |intp| {
                let list = arg(intp, "lst")?.as_list()?;
                let value = list.borrow_mut().pop();
                match value {
                    Some(value) => intp.stack.push(value),
                    None => bail!("Pop from empty list"),
                }
                Ok(())
            }),
        );
    }
    module
}

fn build_map_api() -> ScopeRef {
    let module = Scope::root();
    {
        let mut module = module.borrow_mut();
        module.bind(
            "keys",
            mk_sys_fn(&["m"], |intp| {
                let entries = arg(intp, "m")?.as_map()?;
                let keys = entries
                    .borrow()
                    .keys()
                    .map(|key| Value::str(key.clone()))
                    .collect();
                intp.stack.push(Value::list(keys));
                Ok(())
            }),
        );
    }
    module
}

fn build_file_api() -> ScopeRef {
    let module = Scope::root();
    {
        let mut module = module.borrow_mut();
        module.bind(
            "open",
            mk_sys_fn(&["path"], |intp| {
                let path = arg(intp, "path")?.as_str()?;
                let handle = FileHandle::open(Path::new(path.borrow().as_str()))?;
                intp.stack.push(Value::File(Rc::new(RefCell::new(handle))));
                Ok(())
            }),
        );
        module.bind(
            "create",
            mk_sys_fn(&["path"], |intp| {
                let path = arg(intp, "path")?.as_str()?;
                let handle = FileHandle::create(Path::new(path.borrow().as_str()))?;
                intp.stack.push(Value::File(Rc::new(RefCell::new(handle))));
                Ok(())
            }),
        );
        module.bind(
            "next_char",
            mk_sys_fn(&["file"], |intp| {
                let file = arg(intp, "file")?.as_file()?;
                let value = file.borrow_mut().next_char()?;
                intp.stack.push(Value::Int(value));
                Ok(())
            }),
        );
        module.bind(
            "peek_char",
            mk_sys_fn(&["file"], |intp| {
                let file = arg(intp, "file")?.as_file()?;
                let value = file.borrow_mut().peek_char()?;
                intp.stack.push(Value::Int(value));
                Ok(())
            }),
        );
        module.bind(
            "current_position",
            mk_sys_fn(&["file"], |intp| {
                let file = arg(intp, "file")?.as_file()?;
                let position = file.borrow_mut().position()?;
                intp.stack.push(Value::Int(position));
                Ok(())
            }),
        );
        module.bind(
            "eof",
            mk_sys_fn(&["file"], |intp| {
                let file = arg(intp, "file")?.as_file()?;
                let eof = file.borrow().at_eof();
                intp.stack.push(Value::Bool(eof));
                Ok(())
            }),
        );
        module.bind(
            "write_u8",
            mk_sys_fn(&["file", "val"], |intp| {
                let file = arg(intp, "file")?.as_file()?;
                let value = arg(intp, "val")?.as_int()?;
                let result = file.borrow_mut().write_bytes(&[value as u8]);
                result
            }),
        );
        module.bind(
            "write_u32",
            mk_sys_fn(&["file", "val"], |intp| {
                let file = arg(intp, "file")?.as_file()?;
                let value = arg(intp, "val")?.as_int()?;
                let result = file.borrow_mut().write_bytes(&(value as u32).to_le_bytes());
                result
            }),
        );
        module.bind(
            "write_i32",
            mk_sys_fn(&["file", "val"], |intp| {
                let file = arg(intp, "file")?.as_file()?;
                let value = arg(intp, "val")?.as_int()?;
                let result = file.borrow_mut().write_bytes(&(value as i32).to_le_bytes());
                result
            }),
        );
        module.bind(
            "write_u64",
            mk_sys_fn(&["file", "val"], |intp| {
                let file = arg(intp, "file")?.as_file()?;
                let value = arg(intp, "val")?.as_int()?;
                let result = file.borrow_mut().write_bytes(&(value as u64).to_le_bytes());
                result
            }),
        );
        module.bind(
            "write_str",
            mk_sys_fn(&["file", "str"], |intp| {
                let file = arg(intp, "file")?.as_file()?;
                let text = arg(intp, "str")?.as_str()?;
                let text_ref = text.borrow();
                let result = file.borrow_mut().write_bytes(text_ref.as_bytes());
                result
            }),
        );
    }
    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Statement;
    use crate::lexer::Tokenizer;
    use crate::lower::Analyzer;
    use crate::parser::Parser;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn eval(expr: &str) -> Result<Option<Value>> {
        let scope = create_global_scope();
        let mut tok = Tokenizer::new(expr);
        let expression = Parser::new(&mut tok).next_expr()?;
        let code = Analyzer::new(&tok.identifiers, ".")
            .analyze(&Statement::Return(Some(expression)))?;
        Interpreter::new(scope, code).run()
    }

    fn eval_ok(expr: &str) -> Value {
        eval(expr)
            .expect("evaluation should succeed")
            .expect("expected a value")
    }

    #[test]
    fn string_helpers() {
        assert_eq!(eval_ok("str::length(\"abc\")"), Value::Int(3));
        assert_eq!(eval_ok("str::concat(\"ab\", \"cd\")"), Value::str("abcd"));
        assert_eq!(eval_ok("str::append(\"ab\", 99)"), Value::str("abc"));
        assert_eq!(eval_ok("str::to(7)"), Value::str("7"));
        assert_eq!(eval_ok("str::to(\"raw\")"), Value::str("raw"));
        assert_eq!(eval_ok("str::to([1, 2])"), Value::str("[ 1, 2 ]"));
    }

    #[test]
    fn list_helpers() {
        assert_eq!(eval_ok("list::length([1, 2, 3])"), Value::Int(3));
        assert_eq!(
            eval_ok("list::concat([1], [2, 3])").to_string(),
            "[ 1, 2, 3 ]"
        );
        assert_eq!(eval_ok("list::append([1], 2)").to_string(), "[ 1, 2 ]");
        assert_eq!(eval_ok("list::pop([1, 2])"), Value::Int(2));
    }

    #[test]
    fn pop_from_empty_list_is_an_error() {
        let err = eval("list::pop([ ])").expect_err("expected failure");
        assert!(err.to_string().contains("empty list"));
    }

    #[test]
    fn map_keys_in_deterministic_order() {
        assert_eq!(
            eval_ok("map::keys({ b: 1, a: 2 })").to_string(),
            "[ \"a\", \"b\" ]"
        );
    }

    #[test]
    fn error_builtin_raises_a_runtime_error() {
        let err = eval("error(\"boom\")").expect_err("expected failure");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn nil_is_bound_in_the_global_scope() {
        assert_eq!(eval_ok("nil == nil"), Value::Bool(true));
    }

    #[test]
    fn file_write_and_read_round_trip() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("hek-file-test-{nanos}.bin"));
        let path_text = path.to_str().expect("utf-8 temp path").to_string();

        let scope = create_global_scope();
        let source = format!(
            "let f = file::create(\"{path_text}\"); \
             file::write_u8(f, 104); \
             file::write_str(f, \"i\")"
        );
        let mut tok = Tokenizer::new(source);
        while !tok.peek().expect("token").is_eof() {
            let statement = Parser::new(&mut tok).next_stmt().expect("parse");
            let code = Analyzer::new(&tok.identifiers, ".")
                .analyze(&statement)
                .expect("lower");
            Interpreter::new(Rc::clone(&scope), code)
                .run()
                .expect("write script");
        }
        drop(scope);

        let scope = create_global_scope();
        let source = format!("let f = file::open(\"{path_text}\")");
        let mut tok = Tokenizer::new(source);
        let statement = Parser::new(&mut tok).next_stmt().expect("parse");
        let code = Analyzer::new(&tok.identifiers, ".")
            .analyze(&statement)
            .expect("lower");
        Interpreter::new(Rc::clone(&scope), code)
            .run()
            .expect("open script");

        let eval_in = |scope: &ScopeRef, expr: &str| {
            let mut tok = Tokenizer::new(expr);
            let expression = Parser::new(&mut tok).next_expr().expect("parse");
            let code = Analyzer::new(&tok.identifiers, ".")
                .analyze(&Statement::Return(Some(expression)))
                .expect("lower");
            Interpreter::new(Rc::clone(scope), code)
                .run()
                .expect("eval")
                .expect("value")
        };

        assert_eq!(eval_in(&scope, "file::peek_char(f)"), Value::Int(104));
        assert_eq!(eval_in(&scope, "file::current_position(f)"), Value::Int(0));
        assert_eq!(eval_in(&scope, "file::next_char(f)"), Value::Int(104));
        assert_eq!(eval_in(&scope, "file::next_char(f)"), Value::Int(105));
        assert_eq!(eval_in(&scope, "file::eof(f)"), Value::Bool(false));
        assert_eq!(eval_in(&scope, "file::next_char(f)"), Value::Int(-1));
        assert_eq!(eval_in(&scope, "file::eof(f)"), Value::Bool(true));

        std::fs::remove_file(&path).ok();
    }
}
