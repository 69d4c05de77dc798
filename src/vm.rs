use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};

use crate::lower::Instruction;
use crate::scope::{self, Scope, ScopeRef};
use crate::token::OpKind;
use crate::value::{FnValue, Value};

/// Stack interpreter over one instruction list.
///
/// Each function call spins up a nested interpreter with its own stack and
/// program counter; the scope chain is the only state shared with the
/// caller. The interpreter's root scope doubles as the "global" scope for
/// functions that captured nothing.
pub struct Interpreter {
    pub global_scope: ScopeRef,
    pub current_scope: ScopeRef,
    pub stack: Vec<Value>,
    code: Rc<Vec<Instruction>>,
    pc: usize,
    bytecode_root: PathBuf,
}

impl Interpreter {
    pub fn new(scope: ScopeRef, code: impl Into<Rc<Vec<Instruction>>>) -> Self {
        Self {
            global_scope: Rc::clone(&scope),
            current_scope: scope,
            stack: Vec::new(),
            code: code.into(),
            pc: 0,
            bytecode_root: PathBuf::from("."),
        }
    }

    /// Directory against which `import` instructions resolve sibling
    /// bytecode files.
    pub fn with_bytecode_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.bytecode_root = root.into();
        self
    }

    /// Runs to the end of the instruction list and returns the value left
    /// on top of the stack, if any.
    pub fn run(&mut self) -> Result<Option<Value>> {
        self.pc = 0;
        while self.pc < self.code.len() {
            let instruction = self.code[self.pc].clone();
            self.pc += 1;
            self.exec(&instruction)?;
        }
        Ok(self.stack.last().cloned())
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| anyhow!("Stack underflow"))
    }

    fn top(&self) -> Result<&Value> {
        self.stack.last().ok_or_else(|| anyhow!("Stack underflow"))
    }

    /// Scans forward from the program counter for the matching marker.
    fn go_to_marker(&mut self, id: u32) -> Result<()> {
        for position in self.pc..self.code.len() {
            if matches!(self.code[position], Instruction::Marker(found) if found == id) {
                self.pc = position;
                return Ok(());
            }
        }
        bail!("Unknown marker jump {id}");
    }

    fn exec(&mut self, instruction: &Instruction) -> Result<()> {
        match instruction {
            Instruction::Nop | Instruction::Marker(_) => {}
            Instruction::Discard => {
                self.stack.pop();
            }
            Instruction::Duplicate => {
                let top = self.top()?.clone();
                self.stack.push(top);
            }
            Instruction::Literal(template) => {
                let value = template.deep_clone()?;
                self.stack.push(value);
            }
            Instruction::GetBinding(name) => {
                let value = scope::lookup(&self.current_scope, name)?;
                self.stack.push(value);
            }
            Instruction::GetQualified(path) => {
                let value = scope::lookup_qualified(&self.current_scope, path)?;
                self.stack.push(value);
            }
            Instruction::SetBinding(name) => {
                let value = self.pop()?;
                scope::assign(&self.current_scope, name, value)?;
            }
            Instruction::Bind(name) => {
                let value = self.pop()?;
                self.current_scope.borrow_mut().bind(name.clone(), value);
            }
            Instruction::EnterScope => {
                self.current_scope = Scope::child_of(&self.current_scope);
            }
            Instruction::ExitScope => {
                let parent = self.parent_scope()?;
                self.current_scope = parent;
            }
            Instruction::ExitAsModule(name) => {
                let parent = self.parent_scope()?;
                scope::publish_module(&parent, name, &self.current_scope);
                self.current_scope = parent;
            }
            Instruction::If { if_true, if_false } => {
                let condition = self.pop()?.as_bool()?;
                if condition {
                    self.go_to_marker(*if_true)?;
                } else {
                    self.go_to_marker(*if_false)?;
                }
            }
            Instruction::BinOp(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                let result = binary_op(*op, &left, &right)?;
                self.stack.push(result);
            }
            Instruction::LogNot => {
                let value = self.pop()?.as_bool()?;
                self.stack.push(Value::Bool(!value));
            }
            Instruction::Jump(target) => {
                self.pc = *target as usize;
            }
            Instruction::JumpToMarker(id) => {
                self.go_to_marker(*id)?;
            }
            Instruction::MakeClosure { name, params, body } => {
                self.stack.push(Value::Fn(Rc::new(FnValue {
                    name: name.clone(),
                    params: params.clone(),
                    body: Rc::clone(body),
                    closure: Some(Rc::clone(&self.current_scope)),
                })));
            }
            Instruction::Call(argc) => self.call(*argc)?,
            Instruction::Ret => {
                self.pc = self.code.len();
            }
            Instruction::GetIndex => self.get_index()?,
            Instruction::SetIndex => self.set_index()?,
            Instruction::GetKey => {
                let key = self.pop()?.as_str()?.borrow().clone();
                let map = self.pop()?.as_map()?;
                let value = map.borrow().get(&key).cloned().unwrap_or(Value::Nil);
                self.stack.push(value);
            }
            Instruction::SetKey => {
                // Leaves the map on the stack; map-literal lowering chains
                // one set-key per entry over the same map.
                let value = self.pop()?;
                let key = self.pop()?.as_str()?.borrow().clone();
                let map = self.top()?.as_map()?;
                map.borrow_mut().insert(key, value);
            }
            Instruction::AppendList => {
                let value = self.pop()?;
                let list = self.top()?.as_list()?;
                list.borrow_mut().push(value);
            }
            Instruction::System(callback) => (*callback.0)(self)?,
            Instruction::Import { name, inner } => self.import(name, *inner)?,
        }
        Ok(())
    }

    fn parent_scope(&self) -> Result<ScopeRef> {
        self.current_scope
            .borrow()
            .parent
            .clone()
            .ok_or_else(|| anyhow!("Cannot exit the root scope"))
    }

    fn call(&mut self, argc: u32) -> Result<()> {
        let function = self.pop()?.as_fn()?;
        if argc as usize != function.params.len() {
            let name = function
                .name
                .as_deref()
                .map(|name| format!(" '{name}'"))
                .unwrap_or_default();
            bail!(
                "Function{name} expected {} arguments, got {argc}",
                function.params.len()
            );
        }
        let parent = function
            .closure
            .clone()
            .unwrap_or_else(|| Rc::clone(&self.global_scope));
        let frame = Scope::child_of(&parent);
        for param in &function.params {
            let value = self.stack.pop().ok_or_else(|| {
                anyhow!("Expected more arguments for call, stack bottomed out")
            })?;
            frame.borrow_mut().bind(param.clone(), value);
        }
        let mut nested = Interpreter::new(frame, Rc::clone(&function.body))
            .with_bytecode_root(self.bytecode_root.clone());
        if let Some(result) = nested.run()? {
            self.stack.push(result);
        }
        Ok(())
    }

    fn get_index(&mut self) -> Result<()> {
        let index = self.pop()?;
        let target = self.pop()?;
        match &target {
            Value::List(values) => {
                let i = index.as_int()?;
                let values = values.borrow();
                if i < 0 || i as usize >= values.len() {
                    bail!("List index out of bounds: index {i}, len {}", values.len());
                }
                self.stack.push(values[i as usize].clone());
            }
            Value::Map(entries) => {
                let key = index.as_str()?.borrow().clone();
                let value = entries.borrow().get(&key).cloned().unwrap_or(Value::Nil);
                self.stack.push(value);
            }
            Value::Str(contents) => {
                let i = index.as_int()?;
                let contents = contents.borrow();
                let ch = usize::try_from(i)
                    .ok()
                    .and_then(|i| contents.chars().nth(i));
                match ch {
                    Some(ch) => self.stack.push(Value::Int(ch as i64)),
                    None => bail!(
                        "String index out of bounds: index {i}, len {}",
                        contents.chars().count()
                    ),
                }
            }
            other => bail!("Attempted to index a {}", other.type_name()),
        }
        Ok(())
    }

    fn set_index(&mut self) -> Result<()> {
        let value = self.pop()?;
        let index = self.pop()?;
        let target = self.pop()?;
        match &target {
            Value::List(values) => {
                let i = index.as_int()?;
                let mut values = values.borrow_mut();
                if i < 0 || i as usize >= values.len() {
                    bail!("List index out of bounds: index {i}, len {}", values.len());
                }
                values[i as usize] = value;
            }
            Value::Map(entries) => {
                let key = index.as_str()?.borrow().clone();
                entries.borrow_mut().insert(key, value);
            }
            other => bail!("Attempted to index-assign a {}", other.type_name()),
        }
        Ok(())
    }

    fn import(&mut self, name: &str, inner: bool) -> Result<()> {
        let path = self.bytecode_root.join(format!("{name}.bcc"));
        let bytes =
            fs::read(&path).with_context(|| format!("Reading {}", path.display()))?;
        let mut code = crate::bytecode::decode(&bytes)
            .with_context(|| format!("Decoding {}", path.display()))?;
        if !inner {
            code.insert(0, Instruction::EnterScope);
            code.push(Instruction::ExitAsModule(name.to_string()));
        }
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut nested =
            Interpreter::new(Rc::clone(&self.current_scope), code).with_bytecode_root(root);
        nested.run()?;
        Ok(())
    }
}

fn binary_op(op: OpKind, left: &Value, right: &Value) -> Result<Value> {
    Ok(match op {
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
            let a = left.as_int()?;
            let b = right.as_int()?;
            let value = match op {
                OpKind::Add => a.wrapping_add(b),
                OpKind::Sub => a.wrapping_sub(b),
                OpKind::Mul => a.wrapping_mul(b),
                OpKind::Div => {
                    if b == 0 {
                        bail!("Division by zero");
                    }
                    a.wrapping_div(b)
                }
                _ => unreachable!(),
            };
            Value::Int(value)
        }
        OpKind::Eq => Value::Bool(left.equals(right)),
        OpKind::Neq => Value::Bool(!left.equals(right)),
        OpKind::Less | OpKind::Greater | OpKind::LessEq | OpKind::GreaterEq => {
            let a = left.as_int()?;
            let b = right.as_int()?;
            let value = match op {
                OpKind::Less => a < b,
                OpKind::LessEq => a <= b,
                OpKind::Greater => a > b,
                OpKind::GreaterEq => a >= b,
                _ => unreachable!(),
            };
            Value::Bool(value)
        }
        OpKind::AndL | OpKind::OrL => {
            let a = left.as_bool()?;
            let b = right.as_bool()?;
            Value::Bool(if op == OpKind::AndL { a && b } else { a || b })
        }
        OpKind::Assign | OpKind::Dot | OpKind::NotL => {
            bail!("Unexpected operator '{}'", op.symbol())
        }
    })
}
