//! Flat wire codec for instruction lists.
//!
//! A code block is an unsigned 64-bit little-endian instruction count
//! followed by one-byte opcodes with opcode-specific payloads. Strings are
//! NUL-terminated; numeric fields are little-endian fixed width. Closure
//! bodies nest recursively as full blocks. The opcode numbers are wire
//! contract and never reassigned.

use anyhow::{bail, Context, Result};
use std::rc::Rc;

use crate::lower::Instruction;
use crate::token::OpKind;
use crate::value::Value;

const OP_NOP: u8 = 0;
const OP_DISCARD: u8 = 1;
const OP_DUPLICATE: u8 = 2;
const OP_LITERAL: u8 = 3;
const OP_GET_BINDING: u8 = 4;
const OP_GET_QUALIFIED: u8 = 5;
const OP_SET_BINDING: u8 = 6;
const OP_BIND: u8 = 7;
const OP_ENTER_SCOPE: u8 = 8;
const OP_EXIT_SCOPE: u8 = 9;
const OP_EXIT_AS_MODULE: u8 = 10;
const OP_IF: u8 = 11;
const OP_BIN_OP: u8 = 12;
const OP_LOG_NOT: u8 = 13;
const OP_JUMP: u8 = 14;
const OP_MARKER: u8 = 15;
const OP_JUMP_TO_MARKER: u8 = 16;
const OP_MAKE_CLOSURE: u8 = 17;
const OP_CALL: u8 = 18;
const OP_RET: u8 = 19;
const OP_GET_INDEX: u8 = 30;
const OP_SET_INDEX: u8 = 31;
const OP_GET_KEY: u8 = 32;
const OP_SET_KEY: u8 = 33;
const OP_APPEND_LIST: u8 = 50;
const OP_IMPORT_MODULE: u8 = 64;

const LIT_NIL: u8 = 0;
const LIT_INT: u8 = 1;
const LIT_STR: u8 = 2;
const LIT_BOOL: u8 = 3;
const LIT_EMPTY_LIST: u8 = 4;
const LIT_EMPTY_MAP: u8 = 5;

/// Name flag on the closure parameter-count byte.
const CLOSURE_NAMED: u8 = 0x80;

pub fn encode(code: &[Instruction]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_block(&mut out, code)?;
    Ok(out)
}

fn encode_block(out: &mut Vec<u8>, code: &[Instruction]) -> Result<()> {
    out.extend_from_slice(&(code.len() as u64).to_le_bytes());
    for instruction in code {
        encode_instruction(out, instruction)?;
    }
    Ok(())
}

fn encode_str(out: &mut Vec<u8>, text: &str) -> Result<()> {
    if text.bytes().any(|byte| byte == 0) {
        bail!("Cannot serialize string containing a NUL byte");
    }
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    Ok(())
}

fn encode_instruction(out: &mut Vec<u8>, instruction: &Instruction) -> Result<()> {
    match instruction {
        Instruction::Nop => out.push(OP_NOP),
        Instruction::Discard => out.push(OP_DISCARD),
        Instruction::Duplicate => out.push(OP_DUPLICATE),
        Instruction::Literal(value) => {
            out.push(OP_LITERAL);
            encode_literal(out, value)?;
        }
        Instruction::GetBinding(name) => {
            out.push(OP_GET_BINDING);
            encode_str(out, name)?;
        }
        Instruction::GetQualified(path) => {
            out.push(OP_GET_QUALIFIED);
            let length = u8::try_from(path.len())
                .map_err(|_| anyhow::anyhow!("Qualified path too long to serialize"))?;
            out.push(length);
            for segment in path {
                encode_str(out, segment)?;
            }
        }
        Instruction::SetBinding(name) => {
            out.push(OP_SET_BINDING);
            encode_str(out, name)?;
        }
        Instruction::Bind(name) => {
            out.push(OP_BIND);
            encode_str(out, name)?;
        }
        Instruction::EnterScope => out.push(OP_ENTER_SCOPE),
        Instruction::ExitScope => out.push(OP_EXIT_SCOPE),
        Instruction::ExitAsModule(name) => {
            out.push(OP_EXIT_AS_MODULE);
            encode_str(out, name)?;
        }
        Instruction::If { if_true, if_false } => {
            out.push(OP_IF);
            out.extend_from_slice(&if_true.to_le_bytes());
            out.extend_from_slice(&if_false.to_le_bytes());
        }
        Instruction::BinOp(op) => {
            out.push(OP_BIN_OP);
            out.push(op.to_byte());
        }
        Instruction::LogNot => out.push(OP_LOG_NOT),
        Instruction::Jump(target) => {
            out.push(OP_JUMP);
            out.extend_from_slice(&target.to_le_bytes());
        }
        Instruction::Marker(id) => {
            out.push(OP_MARKER);
            out.extend_from_slice(&id.to_le_bytes());
        }
        Instruction::JumpToMarker(id) => {
            out.push(OP_JUMP_TO_MARKER);
            out.extend_from_slice(&id.to_le_bytes());
        }
        Instruction::MakeClosure { name, params, body } => {
            out.push(OP_MAKE_CLOSURE);
            if params.len() >= CLOSURE_NAMED as usize {
                bail!("Too many closure parameters to serialize");
            }
            out.push(params.len() as u8 | if name.is_some() { CLOSURE_NAMED } else { 0 });
            if let Some(name) = name {
                encode_str(out, name)?;
            }
            for param in params {
                encode_str(out, param)?;
            }
            encode_block(out, body)?;
        }
        Instruction::Call(argc) => {
            out.push(OP_CALL);
            out.extend_from_slice(&argc.to_le_bytes());
        }
        Instruction::Ret => out.push(OP_RET),
        Instruction::GetIndex => out.push(OP_GET_INDEX),
        Instruction::SetIndex => out.push(OP_SET_INDEX),
        Instruction::GetKey => out.push(OP_GET_KEY),
        Instruction::SetKey => out.push(OP_SET_KEY),
        Instruction::AppendList => out.push(OP_APPEND_LIST),
        Instruction::System(_) => bail!("Cannot serialize system instruction"),
        Instruction::Import { name, inner } => {
            out.push(OP_IMPORT_MODULE);
            out.push(u8::from(*inner));
            encode_str(out, name)?;
        }
    }
    Ok(())
}

fn encode_literal(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Nil => out.push(LIT_NIL),
        Value::Int(value) => {
            out.push(LIT_INT);
            out.extend_from_slice(&value.to_le_bytes());
        }
        Value::Str(contents) => {
            out.push(LIT_STR);
            encode_str(out, &contents.borrow())?;
        }
        Value::Bool(value) => {
            out.push(LIT_BOOL);
            out.push(u8::from(*value));
        }
        Value::List(values) if values.borrow().is_empty() => out.push(LIT_EMPTY_LIST),
        Value::Map(entries) if entries.borrow().is_empty() => out.push(LIT_EMPTY_MAP),
        other => bail!("Cannot serialize {} literal", other.type_name()),
    }
    Ok(())
}

pub fn decode(bytes: &[u8]) -> Result<Vec<Instruction>> {
    let mut reader = Reader { bytes, pos: 0 };
    decode_block(&mut reader)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> Result<u8> {
        let byte = self
            .bytes
            .get(self.pos)
            .copied()
            .context("Unexpected end of bytecode")?;
        self.pos += 1;
        Ok(byte)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos.checked_add(N).context("Unexpected end of bytecode")?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .context("Unexpected end of bytecode")?;
        self.pos = end;
        Ok(slice.try_into().expect("slice length checked"))
    }

    fn str(&mut self) -> Result<String> {
        let start = self.pos;
        while self.u8()? != 0 {}
        let contents = &self.bytes[start..self.pos - 1];
        String::from_utf8(contents.to_vec()).context("Invalid UTF-8 in bytecode string")
    }
}

fn decode_block(reader: &mut Reader) -> Result<Vec<Instruction>> {
    let count = reader.u64()?;
    let mut code = Vec::new();
    for _ in 0..count {
        code.push(decode_instruction(reader)?);
    }
    Ok(code)
}

fn decode_instruction(reader: &mut Reader) -> Result<Instruction> {
    let opcode = reader.u8()?;
    Ok(match opcode {
        OP_NOP => Instruction::Nop,
        OP_DISCARD => Instruction::Discard,
        OP_DUPLICATE => Instruction::Duplicate,
        OP_LITERAL => Instruction::Literal(decode_literal(reader)?),
        OP_GET_BINDING => Instruction::GetBinding(reader.str()?),
        OP_GET_QUALIFIED => {
            let length = reader.u8()?;
            let mut path = Vec::with_capacity(length as usize);
            for _ in 0..length {
                path.push(reader.str()?);
            }
            Instruction::GetQualified(path)
        }
        OP_SET_BINDING => Instruction::SetBinding(reader.str()?),
        OP_BIND => Instruction::Bind(reader.str()?),
        OP_ENTER_SCOPE => Instruction::EnterScope,
        OP_EXIT_SCOPE => Instruction::ExitScope,
        OP_EXIT_AS_MODULE => Instruction::ExitAsModule(reader.str()?),
        OP_IF => Instruction::If {
            if_true: reader.u32()?,
            if_false: reader.u32()?,
        },
        OP_BIN_OP => {
            let kind = reader.u8()?;
            match OpKind::from_byte(kind) {
                Some(op) => Instruction::BinOp(op),
                None => bail!("Unknown operator kind {kind}"),
            }
        }
        OP_LOG_NOT => Instruction::LogNot,
        OP_JUMP => Instruction::Jump(reader.u32()?),
        OP_MARKER => Instruction::Marker(reader.u32()?),
        OP_JUMP_TO_MARKER => Instruction::JumpToMarker(reader.u32()?),
        OP_MAKE_CLOSURE => {
            let count = reader.u8()?;
            let name = if count & CLOSURE_NAMED != 0 {
                Some(reader.str()?)
            } else {
                None
            };
            let mut params = Vec::new();
            for _ in 0..(count & !CLOSURE_NAMED) {
                params.push(reader.str()?);
            }
            let body = decode_block(reader)?;
            Instruction::MakeClosure {
                name,
                params,
                body: Rc::new(body),
            }
        }
        OP_CALL => Instruction::Call(reader.u32()?),
        OP_RET => Instruction::Ret,
        OP_GET_INDEX => Instruction::GetIndex,
        OP_SET_INDEX => Instruction::SetIndex,
        OP_GET_KEY => Instruction::GetKey,
        OP_SET_KEY => Instruction::SetKey,
        OP_APPEND_LIST => Instruction::AppendList,
        OP_IMPORT_MODULE => {
            let inner = reader.u8()? != 0;
            Instruction::Import {
                name: reader.str()?,
                inner,
            }
        }
        _ => bail!("Unknown opcode {opcode}"),
    })
}

fn decode_literal(reader: &mut Reader) -> Result<Value> {
    let tag = reader.u8()?;
    Ok(match tag {
        LIT_NIL => Value::Nil,
        LIT_INT => Value::Int(reader.i64()?),
        LIT_STR => Value::str(reader.str()?),
        LIT_BOOL => Value::Bool(reader.u8()? != 0),
        LIT_EMPTY_LIST => Value::list(Vec::new()),
        LIT_EMPTY_MAP => Value::map(Default::default()),
        _ => bail!("Unknown literal tag {tag}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{self, Scope};
    use crate::vm::Interpreter;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn round_trip(code: Vec<Instruction>) {
        let bytes = encode(&code).expect("encode should succeed");
        let decoded = decode(&bytes).expect("decode should succeed");
        assert_eq!(decoded, code);
    }

    #[test]
    fn round_trips_every_payload_shape() {
        round_trip(vec![
            Instruction::Nop,
            Instruction::Discard,
            Instruction::Duplicate,
            Instruction::Literal(Value::Nil),
            Instruction::Literal(Value::Int(-42)),
            Instruction::Literal(Value::str("hello")),
            Instruction::Literal(Value::Bool(true)),
            Instruction::Literal(Value::list(Vec::new())),
            Instruction::Literal(Value::map(Default::default())),
            Instruction::GetBinding("x".to_string()),
            Instruction::GetQualified(vec!["a".to_string(), "b".to_string()]),
            Instruction::SetBinding("x".to_string()),
            Instruction::Bind("y".to_string()),
            Instruction::EnterScope,
            Instruction::ExitScope,
            Instruction::ExitAsModule("m".to_string()),
            Instruction::If {
                if_true: 1,
                if_false: 2,
            },
            Instruction::BinOp(OpKind::Add),
            Instruction::LogNot,
            Instruction::Jump(3),
            Instruction::Marker(1),
            Instruction::JumpToMarker(2),
            Instruction::Call(2),
            Instruction::Ret,
            Instruction::GetIndex,
            Instruction::SetIndex,
            Instruction::GetKey,
            Instruction::SetKey,
            Instruction::AppendList,
            Instruction::Import {
                name: "util".to_string(),
                inner: false,
            },
        ]);
    }

    #[test]
    fn round_trips_nested_closure_bodies() {
        let inner = Instruction::MakeClosure {
            name: None,
            params: vec![],
            body: Rc::new(vec![Instruction::Literal(Value::Int(7)), Instruction::Ret]),
        };
        round_trip(vec![Instruction::MakeClosure {
            name: Some("make".to_string()),
            params: vec!["a".to_string(), "b".to_string()],
            body: Rc::new(vec![inner, Instruction::Ret]),
        }]);
    }

    #[test]
    fn errors_on_unknown_opcode() {
        let mut bytes = 1u64.to_le_bytes().to_vec();
        bytes.push(200);
        let err = decode(&bytes).expect_err("expected decode failure");
        assert!(err.to_string().contains("Unknown opcode 200"));
    }

    #[test]
    fn errors_on_truncated_stream() {
        let code = vec![Instruction::GetBinding("name".to_string())];
        let bytes = encode(&code).expect("encode should succeed");
        let err = decode(&bytes[..bytes.len() - 2]).expect_err("expected decode failure");
        assert!(err.to_string().contains("Unexpected end of bytecode"));
    }

    #[test]
    fn refuses_to_serialize_system_instructions() {
        use crate::lower::SystemFn;
        let code = vec![Instruction::System(SystemFn(Rc::new(
            |_: &mut Interpreter| Ok(()),
        )))];
        let err = encode(&code).expect_err("expected encode failure");
        assert!(err.to_string().contains("system instruction"));
    }

    #[test]
    fn refuses_to_serialize_populated_list_literals() {
        let code = vec![Instruction::Literal(Value::list(vec![Value::Int(1)]))];
        let err = encode(&code).expect_err("expected encode failure");
        assert!(err.to_string().contains("Cannot serialize"));
    }

    #[test]
    fn import_instruction_loads_sibling_bytecode_at_run_time() {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        dir.push(format!("hek-bytecode-test-{nanos}"));
        fs::create_dir_all(&dir).expect("create temp dir");

        let module = vec![
            Instruction::Literal(Value::Int(7)),
            Instruction::Bind("seven".to_string()),
        ];
        let bytes = encode(&module).expect("encode should succeed");
        fs::write(dir.join("util.bcc"), bytes).expect("write module file");

        let scope = Scope::root();
        let code = vec![Instruction::Import {
            name: "util".to_string(),
            inner: false,
        }];
        Interpreter::new(Rc::clone(&scope), code)
            .with_bytecode_root(&dir)
            .run()
            .expect("import should succeed");

        let path: Vec<String> = ["util", "seven"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            scope::lookup_qualified(&scope, &path).expect("bound"),
            Value::Int(7)
        );

        fs::remove_dir_all(&dir).ok();
    }
}
