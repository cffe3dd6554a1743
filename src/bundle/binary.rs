// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The `REGOBUND` binary bundle form.
//!
//! Little-endian throughout. The header carries the magic, format versions,
//! the query plan index, the frame size, a CRC32 of everything after the
//! header, the payload size, and one forward pointer per section. Sections
//! appear in order (`Static=1, Plans=2, Funcs=3, Data=4`), each prefixed by
//! its id; plans and funcs end with a name→offset table. The data section is
//! a BSON-like document with user extension subtypes `IntString (128)` and
//! `FloatString (129)` holding numbers as strings.

use std::collections::BTreeMap;

use super::{Block, Bundle, Function, IrLocation, Operand, Plan, Statement, StatementKind};
use crate::builtins::{Arg, BuiltinType, Decl, DeclArgs, DeclResult};
use crate::lexer::Source;
use crate::number::Number;
use crate::value::Value;
use anyhow::{anyhow, bail, Result};
use core::str::FromStr;

const MAGIC: &[u8; 8] = b"REGOBUND";
const REGO_VERSION: u8 = 1;
const BINARY_VERSION: u8 = 1;
const NUM_RESERVED_BYTES: usize = 5;
// magic + versions + query plan + reserved + local_count + crc32
// + payload size + forward pointers.
const HEADER_TABLE: usize = 8 + 1 + 1 + 1 + NUM_RESERVED_BYTES + 4 + 4;
const HEADER_SIZE: usize = HEADER_TABLE + 8 * 5;

const STATIC_ID: i8 = 1;
const PLANS_ID: i8 = 2;
const FUNCS_ID: i8 = 3;
const DATA_ID: i8 = 4;

// Operand ids.
const OP_LOCAL: i8 = 1;
const OP_STRING: i8 = 2;
const OP_FALSE: i8 = 3;
const OP_TRUE: i8 = 4;

// BSON element ids.
const BSON_STRING: i8 = 2;
const BSON_DOCUMENT: i8 = 3;
const BSON_ARRAY: i8 = 4;
const BSON_BINARY: i8 = 5;
const BSON_BOOLEAN: i8 = 8;
const BSON_NULL: i8 = 10;
const INT_STRING_ID: u8 = 128;
const FLOAT_STRING_ID: u8 = 129;

// Built-in type ids.
const BIT_ANY: i8 = 1;
const BIT_NUMBER: i8 = 2;
const BIT_STRING: i8 = 3;
const BIT_BOOLEAN: i8 = 4;
const BIT_NULL: i8 = 5;
const BIT_ARRAY_DYNAMIC: i8 = 6;
const BIT_ARRAY_STATIC: i8 = 7;
const BIT_OBJECT_DYNAMIC: i8 = 8;
const BIT_OBJECT_STATIC: i8 = 9;
const BIT_OBJECT_HYBRID: i8 = 10;
const BIT_SET: i8 = 11;
const BIT_TYPE_SEQ: i8 = 12;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn put(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn write_sbyte(&mut self, value: i8) {
        self.put(value as u8);
    }

    fn write_uint32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn write_int32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn write_uint64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn write_int64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn write_size(&mut self, value: usize) {
        self.write_uint32(value as u32);
    }

    fn write_string(&mut self, value: &str) {
        self.write_int32(value.len() as i32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn position(&self) -> u64 {
        self.buf.len() as u64
    }

    fn patch_uint32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn patch_uint64(&mut self, offset: usize, value: u64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn update_forward_pointer(&mut self, id: i8) {
        let loc = self.position();
        self.patch_uint64(HEADER_TABLE + id as usize * 8, loc);
    }

    fn write_header(&mut self, local_count: usize, query_plan: Option<usize>) {
        self.buf.extend_from_slice(MAGIC);
        self.put(REGO_VERSION);
        self.put(BINARY_VERSION);
        match query_plan {
            Some(index) => self.write_sbyte(index as i8),
            None => self.write_sbyte(-1),
        }
        for _ in 0..NUM_RESERVED_BYTES {
            self.put(0);
        }
        self.write_size(local_count);
        self.write_uint32(0); // crc32 of everything after the header
        self.write_uint64(0); // payload size
        for _ in 0..4 {
            self.write_uint64(0); // forward pointers
        }
    }

    fn update_header(&mut self) {
        let size = (self.buf.len() - HEADER_SIZE) as u64;
        let crc = crc32fast::hash(&self.buf[HEADER_SIZE..]);
        let crc_offset = HEADER_TABLE - 4;
        self.patch_uint32(crc_offset, crc);
        self.patch_uint64(HEADER_TABLE, size);
    }

    fn write_location(&mut self, location: &Option<IrLocation>) {
        match location {
            None => self.put(1),
            Some(loc) => {
                self.put(2);
                self.write_size(loc.file);
                self.write_size(loc.pos as usize);
                self.write_size(loc.len as usize);
            }
        }
    }

    fn write_operand(&mut self, operand: &Operand) -> Result<()> {
        match operand {
            Operand::Local(index) => {
                self.write_sbyte(OP_LOCAL);
                self.write_size(*index);
            }
            Operand::String(index) => {
                self.write_sbyte(OP_STRING);
                self.write_size(*index);
            }
            Operand::Bool(true) => self.write_sbyte(OP_TRUE),
            Operand::Bool(false) => self.write_sbyte(OP_FALSE),
            _ => bail!("operand {operand:?} cannot be serialized"),
        }
        Ok(())
    }

    fn write_operand_array(&mut self, operands: &[Operand]) -> Result<()> {
        self.put(operands.len() as u8);
        for op in operands {
            self.write_operand(op)?;
        }
        Ok(())
    }

    fn write_statement(&mut self, statement: &Statement) -> Result<()> {
        self.write_sbyte(statement.kind.id());
        self.write_location(&statement.location);

        match &statement.kind {
            StatementKind::ArrayAppend { value, array } => {
                self.write_size(*array);
                self.write_operand(value)?;
            }
            StatementKind::AssignInt { value, target } => {
                self.write_int64(*value);
                self.write_size(*target);
            }
            StatementKind::AssignVarOnce { source, target }
            | StatementKind::AssignVar { source, target } => {
                self.write_operand(source)?;
                self.write_size(*target);
            }
            StatementKind::Block { blocks } => self.write_blocks(blocks)?,
            StatementKind::Break { index } => self.write_size(*index),
            StatementKind::Call { func, args, result } => {
                self.write_string(func);
                self.write_operand_array(args)?;
                self.write_size(*result);
            }
            StatementKind::CallDynamic { path, args, result } => {
                self.write_operand_array(path)?;
                self.write_operand_array(args)?;
                self.write_size(*result);
            }
            StatementKind::Dot { source, key, target } => {
                self.write_operand(source)?;
                self.write_operand(key)?;
                self.write_size(*target);
            }
            StatementKind::Equal { a, b } | StatementKind::NotEqual { a, b } => {
                self.write_operand(a)?;
                self.write_operand(b)?;
            }
            StatementKind::IsArray { source }
            | StatementKind::IsObject { source }
            | StatementKind::IsSet { source } => self.write_operand(source)?,
            StatementKind::IsDefined { source } | StatementKind::IsUndefined { source } => {
                self.write_size(*source)
            }
            StatementKind::Len { source, target } => {
                self.write_operand(source)?;
                self.write_size(*target);
            }
            StatementKind::MakeArray { capacity, target } => {
                self.write_int32(*capacity);
                self.write_size(*target);
            }
            StatementKind::MakeNull { target }
            | StatementKind::MakeObject { target }
            | StatementKind::MakeSet { target } => self.write_size(*target),
            StatementKind::MakeNumberInt { value, target } => {
                self.write_int64(*value);
                self.write_size(*target);
            }
            StatementKind::MakeNumberRef { index, target } => {
                self.write_size(*index);
                self.write_size(*target);
            }
            StatementKind::Not { block } => self.write_block(block)?,
            StatementKind::ObjectInsert { key, value, object }
            | StatementKind::ObjectInsertOnce { key, value, object } => {
                self.write_operand(key)?;
                self.write_operand(value)?;
                self.write_size(*object);
            }
            StatementKind::ObjectMerge { a, b, target } => {
                self.write_size(*a);
                self.write_size(*b);
                self.write_size(*target);
            }
            StatementKind::ResetLocal { target } => self.write_size(*target),
            StatementKind::ResultSetAdd { value } => self.write_size(*value),
            StatementKind::ReturnLocal { source } => self.write_size(*source),
            StatementKind::Scan {
                source,
                key,
                value,
                block,
            } => {
                self.write_size(*source);
                self.write_size(*key);
                self.write_size(*value);
                self.write_block(block)?;
            }
            StatementKind::SetAdd { value, set } => {
                self.write_operand(value)?;
                self.write_size(*set);
            }
            StatementKind::With {
                local,
                path,
                value,
                block,
            } => {
                self.write_size(*local);
                self.write_operand(value)?;
                self.put(path.len() as u8);
                for index in path {
                    self.write_int32(*index as i32);
                }
                self.write_block(block)?;
            }
            StatementKind::Nop => (),
        }
        Ok(())
    }

    fn write_block(&mut self, block: &Block) -> Result<()> {
        self.write_size(block.len());
        for statement in block {
            self.write_statement(statement)?;
        }
        Ok(())
    }

    fn write_blocks(&mut self, blocks: &[Block]) -> Result<()> {
        self.write_size(blocks.len());
        for block in blocks {
            self.write_block(block)?;
        }
        Ok(())
    }

    fn write_builtin_type(&mut self, ty: &BuiltinType) {
        match ty {
            BuiltinType::Any => self.write_sbyte(BIT_ANY),
            BuiltinType::Number => self.write_sbyte(BIT_NUMBER),
            BuiltinType::String => self.write_sbyte(BIT_STRING),
            BuiltinType::Boolean => self.write_sbyte(BIT_BOOLEAN),
            BuiltinType::Null => self.write_sbyte(BIT_NULL),
            BuiltinType::DynamicArray(item) => {
                self.write_sbyte(BIT_ARRAY_DYNAMIC);
                self.write_builtin_type(item);
            }
            BuiltinType::StaticArray(items) => {
                self.write_sbyte(BIT_ARRAY_STATIC);
                self.put(items.len() as u8);
                for item in items {
                    self.write_builtin_type(item);
                }
            }
            BuiltinType::DynamicObject(key, value) => {
                self.write_sbyte(BIT_OBJECT_DYNAMIC);
                self.write_builtin_type(key);
                self.write_builtin_type(value);
            }
            BuiltinType::StaticObject(entries) => {
                self.write_sbyte(BIT_OBJECT_STATIC);
                self.write_bkv_list(entries);
            }
            BuiltinType::HybridObject { key, value, entries } => {
                self.write_sbyte(BIT_OBJECT_HYBRID);
                self.write_builtin_type(key);
                self.write_builtin_type(value);
                self.write_bkv_list(entries);
            }
            BuiltinType::Set(item) => {
                self.write_sbyte(BIT_SET);
                self.write_builtin_type(item);
            }
            BuiltinType::TypeSeq(items) => {
                self.write_sbyte(BIT_TYPE_SEQ);
                self.put(items.len() as u8);
                for item in items {
                    self.write_builtin_type(item);
                }
            }
        }
    }

    fn write_bkv_list(&mut self, entries: &[(BuiltinType, BuiltinType)]) {
        self.put(entries.len() as u8);
        for (key, value) in entries {
            self.write_builtin_type(key);
            self.write_builtin_type(value);
        }
    }

    fn write_builtin_arg(&mut self, arg: &Arg) {
        self.write_string(&arg.name);
        self.write_string(&arg.description);
        self.write_builtin_type(&arg.ty);
    }

    fn write_builtin_decl(&mut self, decl: &Decl) {
        match &decl.args {
            DeclArgs::VarArgs => self.put(1),
            DeclArgs::Args(args) => {
                self.put(2);
                self.put(args.len() as u8);
                for arg in args {
                    self.write_builtin_arg(arg);
                }
            }
        }
        match &decl.result {
            DeclResult::Void => self.put(1),
            DeclResult::Result(arg) => {
                self.put(2);
                self.write_builtin_arg(arg);
            }
        }
    }

    fn write_static(&mut self, bundle: &Bundle) {
        self.update_forward_pointer(STATIC_ID);
        self.write_sbyte(STATIC_ID);

        self.write_size(bundle.files.len());
        for file in bundle.files.iter() {
            self.write_string(file.file());
            self.write_string(file.contents());
        }

        self.write_size(bundle.strings.len());
        for s in &bundle.strings {
            self.write_string(s);
        }

        self.write_size(bundle.builtin_funcs.len());
        for (name, decl) in &bundle.builtin_funcs {
            self.write_string(name);
            self.write_builtin_decl(decl);
        }

        match &bundle.query {
            None => self.write_sbyte(1),
            Some(query) => {
                self.write_sbyte(2);
                self.write_string(query.contents());
            }
        }
    }

    fn write_table(&mut self, start: u64, locs: &BTreeMap<String, u64>) {
        self.write_uint64(start);
        self.write_size(locs.len());
        for (name, loc) in locs {
            self.write_string(name);
            self.write_uint64(*loc);
        }
    }

    fn write_plans(&mut self, plans: &[Plan]) -> Result<()> {
        let start = self.position();
        self.write_sbyte(PLANS_ID);
        self.write_size(plans.len());
        let mut locs = BTreeMap::new();
        for plan in plans {
            locs.insert(plan.name.clone(), self.position());
            self.write_string(&plan.name);
            self.write_blocks(&plan.blocks)?;
        }
        self.update_forward_pointer(PLANS_ID);
        self.write_table(start, &locs);
        Ok(())
    }

    fn write_funcs(&mut self, funcs: &[Function]) -> Result<()> {
        let start = self.position();
        self.write_sbyte(FUNCS_ID);
        self.write_size(funcs.len());
        let mut locs = BTreeMap::new();
        for func in funcs {
            locs.insert(func.name.clone(), self.position());
            self.write_string(&func.name);
            self.put(func.path.len() as u8);
            for segment in &func.path {
                self.write_string(segment);
            }
            self.put(func.parameters.len() as u8);
            for param in &func.parameters {
                self.write_size(*param);
            }
            self.write_size(func.result);
            self.write_blocks(&func.blocks)?;
        }
        self.update_forward_pointer(FUNCS_ID);
        self.write_table(start, &locs);
        Ok(())
    }

    fn write_data(&mut self, data: &Value) -> Result<()> {
        self.update_forward_pointer(DATA_ID);
        self.write_sbyte(DATA_ID);
        self.write_bson_object(data)
    }

    // BSON-like encoding; document sizes exclude the trailing zero byte.

    fn write_cstring(&mut self, value: &str) {
        self.buf.extend_from_slice(value.as_bytes());
        self.put(0);
    }

    fn write_bson_string(&mut self, value: &str) {
        self.write_int32(value.len() as i32 + 1);
        self.buf.extend_from_slice(value.as_bytes());
        self.put(0);
    }

    fn bson_key(key: &Value) -> Result<String> {
        match key {
            Value::String(s) => Ok(s.to_string()),
            other => Ok(serde_json::to_string(other)?),
        }
    }

    fn write_bson_object(&mut self, object: &Value) -> Result<()> {
        let mut inner = Writer { buf: vec![] };
        if let Ok(fields) = object.as_object() {
            for (key, value) in fields {
                inner.write_bson_element(&Self::bson_key(key)?, value)?;
            }
        }
        self.write_int32(inner.buf.len() as i32);
        self.buf.extend_from_slice(&inner.buf);
        self.put(0);
        Ok(())
    }

    fn write_bson_array(&mut self, items: impl Iterator<Item = Value>) -> Result<()> {
        let mut inner = Writer { buf: vec![] };
        for (i, item) in items.enumerate() {
            inner.write_bson_element(&i.to_string(), &item)?;
        }
        self.write_int32(inner.buf.len() as i32);
        self.buf.extend_from_slice(&inner.buf);
        self.put(0);
        Ok(())
    }

    fn write_bson_element(&mut self, key: &str, value: &Value) -> Result<()> {
        match value {
            Value::Number(n) => {
                self.write_sbyte(BSON_BINARY);
                self.write_cstring(key);
                let text = n.to_string();
                self.write_int32(text.len() as i32);
                self.put(match n {
                    Number::Int(_) => INT_STRING_ID,
                    Number::Float(_) => FLOAT_STRING_ID,
                });
                self.buf.extend_from_slice(text.as_bytes());
            }
            Value::Bool(b) => {
                self.write_sbyte(BSON_BOOLEAN);
                self.write_cstring(key);
                self.put(u8::from(*b));
            }
            Value::Null => {
                self.write_sbyte(BSON_NULL);
                self.write_cstring(key);
            }
            Value::String(s) => {
                self.write_sbyte(BSON_STRING);
                self.write_cstring(key);
                self.write_bson_string(s);
            }
            Value::Array(items) => {
                self.write_sbyte(BSON_ARRAY);
                self.write_cstring(key);
                self.write_bson_array(items.iter().cloned())?;
            }
            Value::Set(items) => {
                self.write_sbyte(BSON_ARRAY);
                self.write_cstring(key);
                self.write_bson_array(items.iter().cloned())?;
            }
            Value::Object(_) => {
                self.write_sbyte(BSON_DOCUMENT);
                self.write_cstring(key);
                self.write_bson_object(value)?;
            }
            Value::Undefined => bail!("undefined value in data document"),
        }
        Ok(())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    files: Vec<Source>,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| anyhow!("invalid_argument: offset overflow"))?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| anyhow!("invalid_argument: truncated bundle"))?;
        self.pos = end;
        Ok(slice)
    }

    fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_sbyte(&mut self) -> Result<i8> {
        Ok(self.read_byte()? as i8)
    }

    fn read_uint32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_int32(&mut self) -> Result<i32> {
        Ok(self.read_uint32()? as i32)
    }

    fn read_int64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(arr))
    }

    fn read_uint64(&mut self) -> Result<u64> {
        Ok(self.read_int64()? as u64)
    }

    fn read_size(&mut self) -> Result<usize> {
        Ok(self.read_uint32()? as usize)
    }

    fn read_string(&mut self) -> Result<String> {
        let size = self.read_int32()?;
        if size < 0 {
            bail!("invalid_argument: negative string length");
        }
        let bytes = self.take(size as usize)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn skip_string(&mut self) -> Result<()> {
        let size = self.read_int32()?;
        if size < 0 {
            bail!("invalid_argument: negative string length");
        }
        self.take(size as usize)?;
        Ok(())
    }

    fn assert_id(&mut self, expected: i8, what: &str) -> Result<()> {
        let actual = self.read_sbyte()?;
        if actual != expected {
            bail!("invalid_argument: {what} ID byte missing");
        }
        Ok(())
    }

    fn read_location(&mut self) -> Result<Option<IrLocation>> {
        match self.read_sbyte()? {
            1 => Ok(None),
            2 => {
                let file = self.read_size()?;
                let pos = self.read_size()? as u32;
                let len = self.read_size()? as u32;
                Ok(Some(IrLocation { file, pos, len }))
            }
            id => bail!("invalid_argument: unexpected location id {id}"),
        }
    }

    fn read_operand(&mut self) -> Result<Operand> {
        match self.read_sbyte()? {
            OP_LOCAL => Ok(Operand::Local(self.read_size()?)),
            OP_STRING => Ok(Operand::String(self.read_size()?)),
            OP_TRUE => Ok(Operand::Bool(true)),
            OP_FALSE => Ok(Operand::Bool(false)),
            id => bail!("invalid_argument: invalid operand type {id}"),
        }
    }

    fn read_operand_array(&mut self) -> Result<Vec<Operand>> {
        let size = self.read_byte()? as usize;
        let mut operands = Vec::with_capacity(size);
        for _ in 0..size {
            operands.push(self.read_operand()?);
        }
        Ok(operands)
    }

    fn read_statement(&mut self) -> Result<Statement> {
        let id = self.read_sbyte()?;
        let location = self.read_location()?;

        let kind = match id {
            0 => StatementKind::MakeObject {
                target: self.read_size()?,
            },
            1 => StatementKind::MakeArray {
                capacity: self.read_int32()?,
                target: self.read_size()?,
            },
            2 => StatementKind::MakeSet {
                target: self.read_size()?,
            },
            3 => StatementKind::MakeNull {
                target: self.read_size()?,
            },
            4 => StatementKind::MakeNumberRef {
                index: self.read_size()?,
                target: self.read_size()?,
            },
            5 => StatementKind::MakeNumberInt {
                value: self.read_int64()?,
                target: self.read_size()?,
            },
            6 => StatementKind::AssignInt {
                value: self.read_int64()?,
                target: self.read_size()?,
            },
            7 => StatementKind::Len {
                source: self.read_operand()?,
                target: self.read_size()?,
            },
            8 => StatementKind::IsObject {
                source: self.read_operand()?,
            },
            9 => StatementKind::IsArray {
                source: self.read_operand()?,
            },
            10 => StatementKind::IsSet {
                source: self.read_operand()?,
            },
            11 => StatementKind::ResetLocal {
                target: self.read_size()?,
            },
            12 => StatementKind::AssignVarOnce {
                source: self.read_operand()?,
                target: self.read_size()?,
            },
            13 => StatementKind::IsDefined {
                source: self.read_size()?,
            },
            14 => StatementKind::IsUndefined {
                source: self.read_size()?,
            },
            15 => StatementKind::ReturnLocal {
                source: self.read_size()?,
            },
            16 => {
                let key = self.read_operand()?;
                let value = self.read_operand()?;
                StatementKind::ObjectInsert {
                    key,
                    value,
                    object: self.read_size()?,
                }
            }
            17 => StatementKind::ArrayAppend {
                array: self.read_size()?,
                value: self.read_operand()?,
            },
            18 => StatementKind::SetAdd {
                value: self.read_operand()?,
                set: self.read_size()?,
            },
            19 => {
                let source = self.read_operand()?;
                let key = self.read_operand()?;
                StatementKind::Dot {
                    source,
                    key,
                    target: self.read_size()?,
                }
            }
            20 => StatementKind::AssignVar {
                source: self.read_operand()?,
                target: self.read_size()?,
            },
            21 => StatementKind::ResultSetAdd {
                value: self.read_size()?,
            },
            22 => {
                let a = self.read_operand()?;
                let b = self.read_operand()?;
                StatementKind::Equal { a, b }
            }
            23 => {
                let a = self.read_operand()?;
                let b = self.read_operand()?;
                StatementKind::NotEqual { a, b }
            }
            24 => {
                let key = self.read_operand()?;
                let value = self.read_operand()?;
                StatementKind::ObjectInsertOnce {
                    key,
                    value,
                    object: self.read_size()?,
                }
            }
            25 => StatementKind::ObjectMerge {
                a: self.read_size()?,
                b: self.read_size()?,
                target: self.read_size()?,
            },
            26 => StatementKind::Block {
                blocks: self.read_blocks()?,
            },
            27 => {
                let func = self.read_string()?;
                let args = self.read_operand_array()?;
                StatementKind::Call {
                    func,
                    args,
                    result: self.read_size()?,
                }
            }
            28 => {
                let path = self.read_operand_array()?;
                let args = self.read_operand_array()?;
                StatementKind::CallDynamic {
                    path,
                    args,
                    result: self.read_size()?,
                }
            }
            29 => StatementKind::Not {
                block: self.read_block()?,
            },
            30 => {
                let source = self.read_size()?;
                let key = self.read_size()?;
                let value = self.read_size()?;
                StatementKind::Scan {
                    source,
                    key,
                    value,
                    block: self.read_block()?,
                }
            }
            31 => {
                let local = self.read_size()?;
                let value = self.read_operand()?;
                let count = self.read_byte()? as usize;
                let mut path = Vec::with_capacity(count);
                for _ in 0..count {
                    path.push(self.read_int32()? as usize);
                }
                StatementKind::With {
                    local,
                    path,
                    value,
                    block: self.read_block()?,
                }
            }
            32 => StatementKind::Break {
                index: self.read_size()?,
            },
            33 => StatementKind::Nop,
            _ => bail!("invalid_argument: unsupported statement id {id}"),
        };

        Ok(Statement { kind, location })
    }

    fn read_block(&mut self) -> Result<Block> {
        let size = self.read_size()?;
        let mut block = Vec::with_capacity(size.min(1024));
        for _ in 0..size {
            block.push(self.read_statement()?);
        }
        Ok(block)
    }

    fn read_blocks(&mut self) -> Result<Vec<Block>> {
        let size = self.read_size()?;
        let mut blocks = Vec::with_capacity(size.min(1024));
        for _ in 0..size {
            blocks.push(self.read_block()?);
        }
        Ok(blocks)
    }

    fn read_builtin_type(&mut self) -> Result<BuiltinType> {
        Ok(match self.read_sbyte()? {
            BIT_ANY => BuiltinType::Any,
            BIT_NUMBER => BuiltinType::Number,
            BIT_STRING => BuiltinType::String,
            BIT_BOOLEAN => BuiltinType::Boolean,
            BIT_NULL => BuiltinType::Null,
            BIT_ARRAY_DYNAMIC => BuiltinType::DynamicArray(Box::new(self.read_builtin_type()?)),
            BIT_ARRAY_STATIC => {
                let count = self.read_byte()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_builtin_type()?);
                }
                BuiltinType::StaticArray(items)
            }
            BIT_OBJECT_DYNAMIC => {
                let key = Box::new(self.read_builtin_type()?);
                let value = Box::new(self.read_builtin_type()?);
                BuiltinType::DynamicObject(key, value)
            }
            BIT_OBJECT_STATIC => BuiltinType::StaticObject(self.read_bkv_list()?),
            BIT_OBJECT_HYBRID => {
                let key = Box::new(self.read_builtin_type()?);
                let value = Box::new(self.read_builtin_type()?);
                let entries = self.read_bkv_list()?;
                BuiltinType::HybridObject { key, value, entries }
            }
            BIT_SET => BuiltinType::Set(Box::new(self.read_builtin_type()?)),
            BIT_TYPE_SEQ => {
                let count = self.read_byte()? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_builtin_type()?);
                }
                BuiltinType::TypeSeq(items)
            }
            id => bail!("invalid_argument: unrecognized built-in type id {id}"),
        })
    }

    fn read_bkv_list(&mut self) -> Result<Vec<(BuiltinType, BuiltinType)>> {
        let count = self.read_byte()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.read_builtin_type()?;
            let value = self.read_builtin_type()?;
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn read_builtin_arg(&mut self) -> Result<Arg> {
        let name = self.read_string()?;
        let description = self.read_string()?;
        let ty = self.read_builtin_type()?;
        Ok(Arg {
            name,
            description,
            ty,
        })
    }

    fn read_builtin_decl(&mut self) -> Result<Decl> {
        let args = match self.read_sbyte()? {
            1 => DeclArgs::VarArgs,
            2 => {
                let count = self.read_byte()? as usize;
                let mut args = Vec::with_capacity(count);
                for _ in 0..count {
                    args.push(self.read_builtin_arg()?);
                }
                DeclArgs::Args(args)
            }
            id => bail!("invalid_argument: unsupported built-in args id {id}"),
        };
        let result = match self.read_sbyte()? {
            1 => DeclResult::Void,
            2 => DeclResult::Result(self.read_builtin_arg()?),
            id => bail!("invalid_argument: unsupported built-in return id {id}"),
        };
        Ok(Decl { args, result })
    }

    fn read_static(&mut self, bundle: &mut Bundle) -> Result<()> {
        self.assert_id(STATIC_ID, "Static")?;

        let num_files = self.read_size()?;
        for _ in 0..num_files {
            let origin = self.read_string()?;
            let contents = self.read_string()?;
            let source = Source::synthetic(&origin, contents);
            self.files.push(source.clone());
            bundle.files.push(source);
        }

        let num_strings = self.read_size()?;
        for _ in 0..num_strings {
            bundle.strings.push(self.read_string()?);
        }

        let num_builtins = self.read_size()?;
        for _ in 0..num_builtins {
            let name = self.read_string()?;
            let decl = self.read_builtin_decl()?;
            bundle.builtin_funcs.insert(name, decl);
        }

        match self.read_sbyte()? {
            1 => (),
            2 => {
                bundle.query = Some(Source::synthetic("query", self.read_string()?));
            }
            id => bail!("invalid_argument: unexpected query id {id}"),
        }
        Ok(())
    }

    fn skip_table(&mut self) -> Result<()> {
        self.read_uint64()?;
        let size = self.read_size()?;
        for _ in 0..size {
            self.skip_string()?;
            self.read_uint64()?;
        }
        Ok(())
    }

    fn read_plans(&mut self, bundle: &mut Bundle) -> Result<()> {
        self.assert_id(PLANS_ID, "Plans")?;
        let num_plans = self.read_size()?;
        for i in 0..num_plans {
            let name = self.read_string()?;
            let blocks = self.read_blocks()?;
            bundle.name_to_plan.insert(name.clone(), i);
            bundle.plans.push(Plan { name, blocks });
        }
        self.skip_table()
    }

    fn read_funcs(&mut self, bundle: &mut Bundle) -> Result<()> {
        self.assert_id(FUNCS_ID, "Funcs")?;
        let num_funcs = self.read_size()?;
        for i in 0..num_funcs {
            let name = self.read_string()?;
            let path_len = self.read_byte()? as usize;
            let mut path = Vec::with_capacity(path_len);
            for _ in 0..path_len {
                path.push(self.read_string()?);
            }
            let params_len = self.read_byte()? as usize;
            let mut parameters = Vec::with_capacity(params_len);
            for _ in 0..params_len {
                parameters.push(self.read_size()?);
            }
            let result = self.read_size()?;
            let blocks = self.read_blocks()?;
            let arity = parameters.len();
            bundle.name_to_func.insert(name.clone(), i);
            bundle.functions.push(Function {
                name,
                path,
                parameters,
                result,
                arity,
                cacheable: arity == 2,
                blocks,
            });
        }
        self.skip_table()
    }

    fn read_data(&mut self, bundle: &mut Bundle) -> Result<()> {
        self.assert_id(DATA_ID, "Data")?;
        bundle.data = self.read_bson_object()?;
        Ok(())
    }

    fn read_cstring(&mut self) -> Result<String> {
        let start = self.pos;
        while self.read_byte()? != 0 {}
        let bytes = &self.data[start..self.pos - 1];
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn read_bson_object(&mut self) -> Result<Value> {
        let size = self.read_int32()?;
        if size < 0 {
            bail!("invalid_argument: negative document size");
        }
        let end = self.pos + size as usize;

        let mut object = std::collections::BTreeMap::new();
        loop {
            if self.pos >= end {
                break;
            }
            let element_id = self.read_sbyte()?;
            if element_id == 0 {
                break;
            }
            let key = self.read_cstring()?;
            let value = self.read_bson_element(element_id)?;
            object.insert(Value::from(key), value);
        }
        // Trailing terminator.
        if self.pos == end {
            self.read_byte()?;
        }
        Ok(Value::from(object))
    }

    fn read_bson_array(&mut self) -> Result<Value> {
        let size = self.read_int32()?;
        if size < 0 {
            bail!("invalid_argument: negative document size");
        }
        let end = self.pos + size as usize;

        let mut array = vec![];
        loop {
            if self.pos >= end {
                break;
            }
            let element_id = self.read_sbyte()?;
            if element_id == 0 {
                break;
            }
            self.read_cstring()?;
            array.push(self.read_bson_element(element_id)?);
        }
        if self.pos == end {
            self.read_byte()?;
        }
        Ok(Value::from(array))
    }

    fn read_bson_element(&mut self, element_id: i8) -> Result<Value> {
        match element_id {
            BSON_BOOLEAN => match self.read_byte()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                id => bail!("invalid_argument: invalid boolean id {id}"),
            },
            BSON_NULL => Ok(Value::Null),
            BSON_STRING => {
                let size = self.read_int32()?;
                if size < 1 {
                    bail!("invalid_argument: invalid string size");
                }
                let bytes = self.take(size as usize - 1)?;
                let value = String::from_utf8_lossy(bytes).into_owned();
                self.read_byte()?; // null terminator
                Ok(Value::from(value))
            }
            BSON_BINARY => {
                let size = self.read_int32()?;
                if size < 0 {
                    bail!("invalid_argument: invalid binary size");
                }
                let subtype = self.read_byte()?;
                if subtype != INT_STRING_ID && subtype != FLOAT_STRING_ID {
                    bail!("invalid_argument: invalid binary subtype {subtype}");
                }
                let bytes = self.take(size as usize)?;
                let text = String::from_utf8_lossy(bytes);
                match Number::from_str(&text) {
                    Ok(n) => Ok(Value::Number(n)),
                    Err(_) => bail!("invalid_argument: invalid number {text:?}"),
                }
            }
            BSON_ARRAY => self.read_bson_array(),
            BSON_DOCUMENT => self.read_bson_object(),
            id => bail!("invalid_argument: invalid element id {id}"),
        }
    }
}

impl Bundle {
    /// Serialize to the binary form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = Writer {
            buf: Vec::with_capacity(4096),
        };
        writer.write_header(self.local_count, self.query_plan);
        writer.write_static(self);
        writer.write_plans(&self.plans)?;
        writer.write_funcs(&self.functions)?;
        writer.write_data(&self.data)?;
        writer.update_header();
        Ok(writer.buf)
    }

    /// Load from the binary form, verifying magic, versions and CRC.
    pub fn from_bytes(data: &[u8]) -> Result<Bundle> {
        if data.len() < HEADER_SIZE {
            bail!("invalid_argument: truncated bundle header");
        }
        if &data[0..8] != MAGIC {
            bail!("invalid_argument: mismatched header");
        }
        if data[8] != REGO_VERSION {
            bail!(
                "invalid_argument: unsupported rego version {}; only {} is supported",
                data[8],
                REGO_VERSION
            );
        }
        if data[9] != BINARY_VERSION {
            bail!(
                "invalid_argument: unsupported rego binary version {}; only {} is supported",
                data[9],
                BINARY_VERSION
            );
        }
        let query_plan = data[10] as i8;

        let mut reader = Reader {
            data,
            pos: 11 + NUM_RESERVED_BYTES,
            files: vec![],
        };
        let local_count = reader.read_size()?;
        let expected_crc = reader.read_uint32()?;
        let size = reader.read_uint64()? as usize;
        reader.pos = HEADER_SIZE;

        let payload = data
            .get(HEADER_SIZE..HEADER_SIZE + size)
            .ok_or_else(|| anyhow!("invalid_argument: truncated bundle payload"))?;
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            bail!("invalid_argument: mismatched CRC: {actual_crc} != {expected_crc}");
        }

        // Skip the forward pointer table; sections are read in order.
        reader.pos = HEADER_SIZE;

        let mut bundle = Bundle {
            local_count,
            query_plan: if query_plan >= 0 {
                Some(query_plan as usize)
            } else {
                None
            },
            ..Bundle::default()
        };
        reader.read_static(&mut bundle)?;
        reader.read_plans(&mut bundle)?;
        reader.read_funcs(&mut bundle)?;
        reader.read_data(&mut bundle)?;
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::Arg as BArg;

    fn sample_bundle() -> Bundle {
        let mut bundle = Bundle {
            strings: vec!["result".to_string(), "g0.data.p.allow".to_string()],
            local_count: 4,
            data: Value::from_json_str(r#"{"p": {"x": [1, 2.5, "s", true, null]}}"#).unwrap(),
            ..Bundle::default()
        };
        bundle.files.push(Source::synthetic(
            "policy.rego",
            "package p\nallow := true".to_string(),
        ));
        bundle.builtin_funcs.insert(
            "plus".to_string(),
            Decl::function(
                vec![
                    BArg::new("x", BuiltinType::Number),
                    BArg::new("y", BuiltinType::Number),
                ],
                BArg::new("z", BuiltinType::Number),
            ),
        );
        bundle.functions.push(Function {
            name: "g0.data.p.allow".to_string(),
            path: vec!["g0".to_string(), "data".to_string(), "p".to_string(), "allow".to_string()],
            parameters: vec![0, 1],
            result: 2,
            arity: 2,
            cacheable: true,
            blocks: vec![vec![
                Statement::new(StatementKind::AssignVar {
                    source: Operand::Bool(true),
                    target: 2,
                }),
                Statement::at(
                    StatementKind::ReturnLocal { source: 2 },
                    Some(IrLocation {
                        file: 0,
                        pos: 10,
                        len: 5,
                    }),
                ),
            ]],
        });
        bundle.name_to_func.insert("g0.data.p.allow".to_string(), 0);
        bundle.plans.push(Plan {
            name: "p/allow".to_string(),
            blocks: vec![vec![
                Statement::new(StatementKind::Call {
                    func: "g0.data.p.allow".to_string(),
                    args: vec![Operand::Local(0), Operand::Local(1)],
                    result: 2,
                }),
                Statement::new(StatementKind::MakeObject { target: 3 }),
                Statement::new(StatementKind::ObjectInsert {
                    key: Operand::String(0),
                    value: Operand::Local(2),
                    object: 3,
                }),
                Statement::new(StatementKind::ResultSetAdd { value: 3 }),
            ]],
        });
        bundle.name_to_plan.insert("p/allow".to_string(), 0);
        bundle
    }

    #[test]
    fn round_trips() {
        let bundle = sample_bundle();
        let bytes = bundle.to_bytes().unwrap();
        let loaded = Bundle::from_bytes(&bytes).unwrap();
        assert_eq!(bundle, loaded);
        // Loading what was saved again is byte-stable.
        assert_eq!(bytes, loaded.to_bytes().unwrap());
    }

    #[test]
    fn rejects_bad_magic() {
        let bundle = sample_bundle();
        let mut bytes = bundle.to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(Bundle::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_bad_version() {
        let bundle = sample_bundle();
        let mut bytes = bundle.to_bytes().unwrap();
        bytes[8] = 9;
        assert!(Bundle::from_bytes(&bytes).is_err());
    }

    #[test]
    fn crc_catches_any_payload_flip() {
        let bundle = sample_bundle();
        let bytes = bundle.to_bytes().unwrap();
        for offset in (HEADER_SIZE..bytes.len()).step_by(7) {
            let mut corrupt = bytes.clone();
            corrupt[offset] ^= 0x40;
            let err = Bundle::from_bytes(&corrupt).unwrap_err().to_string();
            assert!(err.contains("invalid_argument"), "offset {offset}: {err}");
        }
    }

    #[test]
    fn sets_round_trip_as_arrays() {
        let mut set = std::collections::BTreeSet::new();
        set.insert(Value::from(2u64));
        set.insert(Value::from(1u64));
        let mut data = std::collections::BTreeMap::new();
        data.insert(Value::from("s"), Value::from(set));
        let bundle = Bundle {
            data: Value::from(data),
            ..Bundle::default()
        };
        let loaded = Bundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap();
        assert_eq!(
            serde_json::to_string(&loaded.data["s"]).unwrap(),
            "[1,2]"
        );
    }
}
