use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, Context, Result};

use crate::lower::Instruction;
use crate::scope::ScopeRef;

/// A runtime value. Strings, lists and maps are shared mutable handles;
/// binding the same list under two names aliases it. Maps keep their keys
/// in sorted order, which is also their print and iteration order.
///
/// Equality lives in [`Value::equals`], not `PartialEq`: the language
/// compares maps by reference identity and lets an integer equal a
/// one-character string. `PartialEq` is structural and only meant for
/// tests and the bytecode codec.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Int(i64),
    Bool(bool),
    Str(Rc<RefCell<String>>),
    List(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<BTreeMap<String, Value>>>),
    Fn(Rc<FnValue>),
    File(Rc<RefCell<FileHandle>>),
}

pub struct FnValue {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: Rc<Vec<Instruction>>,
    /// Scope captured when the closure was made; absent for host functions,
    /// which run against the calling interpreter's root scope.
    pub closure: Option<ScopeRef>,
}

impl fmt::Debug for FnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnValue")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Value {
    pub fn str(contents: impl Into<String>) -> Value {
        Value::Str(Rc::new(RefCell::new(contents.into())))
    }

    pub fn list(values: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(values)))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Int(_) => "integer",
            Value::Bool(_) => "boolean",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Fn(_) => "function",
            Value::File(_) => "file",
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(value) => Ok(*value),
            other => bail!("Expected integer, got {}", other.type_name()),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(value) => Ok(*value),
            other => bail!("Expected boolean, got {}", other.type_name()),
        }
    }

    pub fn as_str(&self) -> Result<Rc<RefCell<String>>> {
        match self {
            Value::Str(contents) => Ok(Rc::clone(contents)),
            other => bail!("Expected string, got {}", other.type_name()),
        }
    }

    pub fn as_list(&self) -> Result<Rc<RefCell<Vec<Value>>>> {
        match self {
            Value::List(values) => Ok(Rc::clone(values)),
            other => bail!("Expected list, got {}", other.type_name()),
        }
    }

    pub fn as_map(&self) -> Result<Rc<RefCell<BTreeMap<String, Value>>>> {
        match self {
            Value::Map(entries) => Ok(Rc::clone(entries)),
            other => bail!("Expected map, got {}", other.type_name()),
        }
    }

    pub fn as_fn(&self) -> Result<Rc<FnValue>> {
        match self {
            Value::Fn(function) => Ok(Rc::clone(function)),
            other => bail!("Expected function, got {}", other.type_name()),
        }
    }

    pub fn as_file(&self) -> Result<Rc<RefCell<FileHandle>>> {
        match self {
            Value::File(handle) => Ok(Rc::clone(handle)),
            other => bail!("Expected file, got {}", other.type_name()),
        }
    }

    /// Language-level equality. Dispatches on the left operand: integers
    /// compare equal to a one-character string holding their code point,
    /// lists compare elementwise, maps only by identity.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(a), Value::Str(s)) => {
                let s = s.borrow();
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(ch), None) => *a == ch as i64,
                    _ => false,
                }
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => *a.borrow() == *b.borrow(),
            (Value::List(a), Value::List(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Fresh deep copy, used by `literal` so every evaluation of a literal
    /// yields a new instance. File handles refuse to be cloned.
    pub fn deep_clone(&self) -> Result<Value> {
        Ok(match self {
            Value::Nil => Value::Nil,
            Value::Int(value) => Value::Int(*value),
            Value::Bool(value) => Value::Bool(*value),
            Value::Str(contents) => Value::str(contents.borrow().clone()),
            Value::List(values) => {
                let mut copied = Vec::with_capacity(values.borrow().len());
                for value in values.borrow().iter() {
                    copied.push(value.deep_clone()?);
                }
                Value::list(copied)
            }
            Value::Map(entries) => {
                let mut copied = BTreeMap::new();
                for (key, value) in entries.borrow().iter() {
                    copied.insert(key.clone(), value.deep_clone()?);
                }
                Value::map(copied)
            }
            Value::Fn(function) => Value::Fn(Rc::new(FnValue {
                name: function.name.clone(),
                params: function.params.clone(),
                body: Rc::clone(&function.body),
                closure: function.closure.clone(),
            })),
            Value::File(_) => bail!("Cannot clone file handle"),
        })
    }

    /// Rendering used by `str::to`: strings yield their raw contents,
    /// everything else its display form.
    pub fn to_text(&self) -> String {
        match self {
            Value::Str(contents) => contents.borrow().clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Str(contents) => write!(f, "\"{}\"", contents.borrow()),
            Value::List(values) => {
                let values = values.borrow();
                if values.is_empty() {
                    return write!(f, "[ ]");
                }
                write!(f, "[ ")?;
                for (position, value) in values.iter().enumerate() {
                    if position > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, " ]")
            }
            Value::Map(entries) => {
                let entries = entries.borrow();
                if entries.is_empty() {
                    return write!(f, "{{ }}");
                }
                write!(f, "{{ ")?;
                for (position, (key, value)) in entries.iter().enumerate() {
                    if position > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, " }}")
            }
            Value::Fn(function) => {
                write!(f, "fn")?;
                if let Some(name) = &function.name {
                    write!(f, " {name}")?;
                }
                write!(f, " (")?;
                for (position, param) in function.params.iter().enumerate() {
                    if position > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ")")?;
                if function.closure.is_some() {
                    write!(f, "&")?;
                }
                Ok(())
            }
            Value::File(_) => write!(f, "<filestream>"),
        }
    }
}

/// Structural comparison for tests and the codec; language equality is
/// [`Value::equals`].
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => *a.borrow() == *b.borrow(),
            (Value::List(a), Value::List(b)) => *a.borrow() == *b.borrow(),
            (Value::Map(a), Value::Map(b)) => *a.borrow() == *b.borrow(),
            (Value::Fn(a), Value::Fn(b)) => Rc::ptr_eq(a, b),
            (Value::File(a), Value::File(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Opaque host value wrapping an open file. Read helpers mirror the C
/// stdio surface the stdlib exposes: reads return -1 at end of stream and
/// latch an eof flag.
pub struct FileHandle {
    file: File,
    eof: bool,
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<filestream>")
    }
}

impl FileHandle {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Error opening file {}", path.display()))?;
        Ok(Self { file, eof: false })
    }

    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Error creating file {}", path.display()))?;
        Ok(Self { file, eof: false })
    }

    pub fn next_char(&mut self) -> Result<i64> {
        let mut byte = [0u8; 1];
        let read = self.file.read(&mut byte)?;
        if read == 0 {
            self.eof = true;
            return Ok(-1);
        }
        Ok(byte[0] as i64)
    }

    pub fn peek_char(&mut self) -> Result<i64> {
        let value = self.next_char()?;
        if value >= 0 {
            self.file.seek(SeekFrom::Current(-1))?;
        }
        Ok(value)
    }

    pub fn position(&mut self) -> Result<i64> {
        Ok(self.file.stream_position()? as i64)
    }

    pub fn at_eof(&self) -> bool {
        self.eof
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        Ok(())
    }
}
