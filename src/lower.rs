use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};

use crate::ast::{Expression, Statement};
use crate::lexer::Tokenizer;
use crate::parser::Parser;
use crate::token::OpKind;
use crate::value::Value;
use crate::vm::Interpreter;

/// Host callback behind a `system` instruction. It reads its arguments
/// from the current scope's parameter bindings and pushes its result onto
/// the interpreter's stack.
#[derive(Clone)]
pub struct SystemFn(pub Rc<dyn Fn(&mut Interpreter) -> Result<()>>);

impl fmt::Debug for SystemFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<system>")
    }
}

impl PartialEq for SystemFn {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Stack-machine instruction set shared by the analyzer, the interpreter
/// and the bytecode codec.
///
/// Jump targets inside structured control flow are abstract `Marker` ids
/// resolved by a forward scan at run time; only the back edge of a loop
/// uses an absolute `Jump` index.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Nop,
    Discard,
    Duplicate,
    Literal(Value),
    GetBinding(String),
    GetQualified(Vec<String>),
    SetBinding(String),
    Bind(String),
    EnterScope,
    ExitScope,
    ExitAsModule(String),
    If { if_true: u32, if_false: u32 },
    BinOp(OpKind),
    LogNot,
    Jump(u32),
    Marker(u32),
    JumpToMarker(u32),
    MakeClosure {
        name: Option<String>,
        params: Vec<String>,
        body: Rc<Vec<Instruction>>,
    },
    Call(u32),
    Ret,
    GetIndex,
    SetIndex,
    GetKey,
    SetKey,
    AppendList,
    System(SystemFn),
    Import { name: String, inner: bool },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Nop => write!(f, "nop"),
            Instruction::Discard => write!(f, "discard"),
            Instruction::Duplicate => write!(f, "duplicate"),
            Instruction::Literal(value) => write!(f, "literal {value}"),
            Instruction::GetBinding(name) => write!(f, "get({name})"),
            Instruction::GetQualified(path) => write!(f, "get q({})", path.join("::")),
            Instruction::SetBinding(name) => write!(f, "set({name})"),
            Instruction::Bind(name) => write!(f, "bind({name})"),
            Instruction::EnterScope => write!(f, "scope ["),
            Instruction::ExitScope => write!(f, "] end scope"),
            Instruction::ExitAsModule(name) => write!(f, "] new module({name})"),
            Instruction::If { if_true, if_false } => {
                write!(f, "if then {if_true} else {if_false}")
            }
            Instruction::BinOp(op) => write!(f, "bin op {}", op.symbol()),
            Instruction::LogNot => write!(f, "notl"),
            Instruction::Jump(target) => write!(f, "jmp {target}"),
            Instruction::Marker(id) => write!(f, "mark {id}:"),
            Instruction::JumpToMarker(id) => write!(f, "jmp mark {id}"),
            Instruction::MakeClosure { name, params, .. } => {
                write!(f, "closure fn")?;
                if let Some(name) = name {
                    write!(f, " {name}")?;
                }
                write!(f, "({})", params.join(", "))
            }
            Instruction::Call(argc) => write!(f, "call {argc}"),
            Instruction::Ret => write!(f, "ret"),
            Instruction::GetIndex => write!(f, "index"),
            Instruction::SetIndex => write!(f, "set index"),
            Instruction::GetKey => write!(f, "get key"),
            Instruction::SetKey => write!(f, "set key"),
            Instruction::AppendList => write!(f, "append"),
            Instruction::System(_) => write!(f, "system"),
            Instruction::Import { name, inner } => {
                write!(f, "import({name}{})", if *inner { ", inner" } else { "" })
            }
        }
    }
}

struct LoopFrame {
    label: Option<usize>,
    start: usize,
    end_marker: u32,
}

/// Flattens one statement tree into a linear instruction list.
///
/// The analyzer is rooted at a directory; `mod name;` statements load and
/// compile `<name>.bcy` from there, and function bodies lower through a
/// fresh analyzer rooted at the same place.
pub struct Analyzer<'a> {
    ids: &'a [String],
    instrs: Vec<Instruction>,
    next_marker: u32,
    loop_stack: Vec<LoopFrame>,
    root: PathBuf,
}

impl<'a> Analyzer<'a> {
    pub fn new(ids: &'a [String], root: impl Into<PathBuf>) -> Self {
        Self {
            ids,
            instrs: Vec::new(),
            next_marker: 0,
            loop_stack: Vec::new(),
            root: root.into(),
        }
    }

    pub fn analyze(mut self, statement: &Statement) -> Result<Vec<Instruction>> {
        self.statement(statement)?;
        Ok(self.instrs)
    }

    fn new_marker(&mut self) -> u32 {
        self.next_marker += 1;
        self.next_marker
    }

    fn emit(&mut self, instruction: Instruction) {
        self.instrs.push(instruction);
    }

    fn name(&self, id: usize) -> String {
        self.ids[id].clone()
    }

    fn statement(&mut self, statement: &Statement) -> Result<()> {
        match statement {
            Statement::Seq { first, second } => {
                self.statement(first)?;
                if let Some(second) = second {
                    self.statement(second)?;
                }
            }
            Statement::Block(None) => {}
            Statement::Block(Some(body)) => {
                self.emit(Instruction::EnterScope);
                self.statement(body)?;
                self.emit(Instruction::ExitScope);
            }
            Statement::Let { name, value } => {
                // A function definition is also the statement's value:
                // a trailing `fn inner() ..` in a function body is what the
                // body evaluates to.
                if let Expression::Function { params, body } = value {
                    self.function(params, body, Some(self.name(*name)))?;
                    self.emit(Instruction::Duplicate);
                } else {
                    self.expression(value)?;
                }
                self.emit(Instruction::Bind(self.name(*name)));
            }
            Statement::Expr(expression) => {
                self.expression(expression)?;
                self.emit(Instruction::Discard);
            }
            Statement::If {
                condition,
                if_true,
                if_false,
            } => {
                self.expression(condition)?;
                let true_mark = self.new_marker();
                let false_mark = self.new_marker();
                self.emit(Instruction::If {
                    if_true: true_mark,
                    if_false: false_mark,
                });
                self.emit(Instruction::Marker(true_mark));
                self.statement(if_true)?;
                if let Some(if_false) = if_false {
                    let end_mark = self.new_marker();
                    self.emit(Instruction::JumpToMarker(end_mark));
                    self.emit(Instruction::Marker(false_mark));
                    self.statement(if_false)?;
                    self.emit(Instruction::Marker(end_mark));
                } else {
                    self.emit(Instruction::Marker(false_mark));
                }
            }
            Statement::Loop { label, body } => {
                let start = self.instrs.len();
                let end_marker = self.new_marker();
                self.loop_stack.push(LoopFrame {
                    label: *label,
                    start,
                    end_marker,
                });
                self.statement(body)?;
                self.emit(Instruction::Jump(start as u32));
                self.emit(Instruction::Marker(end_marker));
                self.loop_stack.pop();
            }
            Statement::Continue(label) => {
                let start = self.find_loop(*label)?.start;
                self.emit(Instruction::Jump(start as u32));
            }
            Statement::Break(label) => {
                let end_marker = self.find_loop(*label)?.end_marker;
                self.emit(Instruction::JumpToMarker(end_marker));
            }
            Statement::Return(value) => {
                if let Some(value) = value {
                    self.expression(value)?;
                }
                self.emit(Instruction::Ret);
            }
            Statement::Module {
                name,
                body,
                inner_import,
            } => {
                if !inner_import {
                    self.emit(Instruction::EnterScope);
                }
                match body {
                    Some(body) => self.statement(body)?,
                    None => {
                        let path = self.root.join(format!("{}.bcy", self.name(*name)));
                        let code = load_and_assemble(&path)?;
                        splice(&mut self.instrs, code);
                    }
                }
                if !inner_import {
                    self.emit(Instruction::ExitAsModule(self.name(*name)));
                }
            }
        }
        Ok(())
    }

    fn find_loop(&self, label: Option<usize>) -> Result<&LoopFrame> {
        match label {
            None => match self.loop_stack.last() {
                Some(frame) => Ok(frame),
                None => bail!("break or continue outside of a loop"),
            },
            Some(label) => {
                for frame in self.loop_stack.iter().rev() {
                    if frame.label == Some(label) {
                        return Ok(frame);
                    }
                }
                bail!("Unknown loop label '{}'", self.ids[label]);
            }
        }
    }

    fn expression(&mut self, expression: &Expression) -> Result<()> {
        match expression {
            Expression::Named(id) => self.emit(Instruction::GetBinding(self.name(*id))),
            Expression::Qualified(path) => {
                let path = path.iter().map(|id| self.name(*id)).collect();
                self.emit(Instruction::GetQualified(path));
            }
            Expression::Integer(value) => self.emit(Instruction::Literal(Value::Int(*value))),
            Expression::Str(contents) => {
                self.emit(Instruction::Literal(Value::str(contents.clone())))
            }
            Expression::Boolean(value) => self.emit(Instruction::Literal(Value::Bool(*value))),
            Expression::List(elements) => {
                self.emit(Instruction::Literal(Value::list(Vec::new())));
                for element in elements {
                    self.expression(element)?;
                    self.emit(Instruction::AppendList);
                }
            }
            Expression::Map(entries) => {
                self.emit(Instruction::Literal(Value::map(Default::default())));
                for (key, value) in entries {
                    self.emit(Instruction::Literal(Value::str(self.name(*key))));
                    self.expression(value)?;
                    self.emit(Instruction::SetKey);
                }
            }
            Expression::BinaryOp { op, left, right } => self.binary_op(*op, left, right)?,
            Expression::Negation(value) => {
                self.expression(value)?;
                self.emit(Instruction::LogNot);
            }
            Expression::Index { collection, index } => {
                self.expression(collection)?;
                self.expression(index)?;
                self.emit(Instruction::GetIndex);
            }
            Expression::Call { callee, args } => {
                // Arguments are pushed in reverse source order so the VM's
                // pops bind the first formal to the first argument.
                for arg in args.iter().rev() {
                    self.expression(arg)?;
                }
                self.expression(callee)?;
                self.emit(Instruction::Call(args.len() as u32));
            }
            Expression::Function { params, body } => self.function(params, body, None)?,
        }
        Ok(())
    }

    fn binary_op(&mut self, op: OpKind, left: &Expression, right: &Expression) -> Result<()> {
        if op == OpKind::Assign {
            if let Expression::BinaryOp {
                op: OpKind::Dot,
                left: object,
                right: key,
            } = left
            {
                let Expression::Named(key) = key.as_ref() else {
                    bail!("Expected identifier after '.'");
                };
                self.expression(object)?;
                self.emit(Instruction::Literal(Value::str(self.name(*key))));
                self.expression(right)?;
                self.emit(Instruction::SetKey);
                return Ok(());
            }
            if let Expression::Index { collection, index } = left {
                self.expression(collection)?;
                self.expression(index)?;
                self.expression(right)?;
                self.emit(Instruction::SetIndex);
                return Ok(());
            }
            let Expression::Named(name) = left else {
                bail!("Invalid assignment target");
            };
            self.expression(right)?;
            self.emit(Instruction::SetBinding(self.name(*name)));
            return Ok(());
        }
        if op == OpKind::Dot {
            let Expression::Named(key) = right else {
                bail!("Expected identifier after '.'");
            };
            self.expression(left)?;
            self.emit(Instruction::Literal(Value::str(self.name(*key))));
            self.emit(Instruction::GetKey);
            return Ok(());
        }
        self.expression(left)?;
        self.expression(right)?;
        self.emit(Instruction::BinOp(op));
        Ok(())
    }

    fn function(
        &mut self,
        params: &[usize],
        body: &Statement,
        name: Option<String>,
    ) -> Result<()> {
        let params = params.iter().map(|id| self.name(*id)).collect();
        let body = Analyzer::new(self.ids, self.root.clone()).analyze(body)?;
        self.emit(Instruction::MakeClosure {
            name,
            params,
            body: Rc::new(body),
        });
        Ok(())
    }
}

/// Appends `code` to `into`, rebasing absolute `Jump` targets by the
/// insertion offset. Nested closure bodies run in their own dispatch and
/// are left untouched.
fn splice(into: &mut Vec<Instruction>, code: Vec<Instruction>) {
    let offset = into.len() as u32;
    into.extend(code.into_iter().map(|instruction| match instruction {
        Instruction::Jump(target) => Instruction::Jump(target + offset),
        other => other,
    }));
}

/// Compiles a source module file to instructions: parses statement by
/// statement and concatenates the lowered code, rooted at the file's
/// directory so nested imports resolve next to it.
pub fn load_and_assemble(path: &Path) -> Result<Vec<Instruction>> {
    let source =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut tok = Tokenizer::new(source);
    let mut code = Vec::new();
    while !tok.peek()?.is_eof() {
        let statement = Parser::new(&mut tok)
            .next_stmt()
            .with_context(|| format!("Parsing {}", path.display()))?;
        let part = Analyzer::new(&tok.identifiers, &root).analyze(&statement)?;
        splice(&mut code, part);
    }
    Ok(code)
}
