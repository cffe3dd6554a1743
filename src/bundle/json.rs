// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The human-readable JSON form of a bundle.
//!
//! A document `{ "data": …, "plan": { "static": …, "plans": …, "funcs": …,
//! "query": … } }`, with each statement rendered as
//! `{"type": "<Name>Stmt", "stmt": { …fields…, "file", "row", "col" }}`.

use super::{Block, Bundle, IrLocation, Operand, Statement, StatementKind};
use crate::builtins::{Arg, BuiltinType, Decl, DeclArgs, DeclResult};
use anyhow::Result;
use serde_json::{json, Map, Value as Json};

fn operand_json(op: &Operand) -> Json {
    match op {
        Operand::Local(index) => json!({"type": "local", "value": index}),
        Operand::String(index) => json!({"type": "string_index", "value": index}),
        Operand::Bool(b) => json!({"type": "bool", "value": b}),
        Operand::Index(index) => json!({"type": "index", "value": index}),
        Operand::Value(v) => json!({"type": "value", "value": v}),
        Operand::None => Json::Null,
    }
}

fn operands_json(ops: &[Operand]) -> Json {
    Json::Array(ops.iter().map(operand_json).collect())
}

fn location_fields(bundle: &Bundle, location: &Option<IrLocation>, stmt: &mut Map<String, Json>) {
    if let Some(loc) = location {
        let (row, col) = match bundle.files.get(loc.file) {
            Some(source) => source.line_col(loc.pos),
            None => (0, 0),
        };
        stmt.insert("file".to_string(), json!(loc.file));
        stmt.insert("row".to_string(), json!(row));
        stmt.insert("col".to_string(), json!(col));
    }
}

fn statement_json(bundle: &Bundle, statement: &Statement) -> Json {
    let mut stmt = Map::new();
    match &statement.kind {
        StatementKind::MakeObject { target }
        | StatementKind::MakeSet { target }
        | StatementKind::MakeNull { target }
        | StatementKind::ResetLocal { target } => {
            stmt.insert("target".to_string(), json!(target));
        }
        StatementKind::MakeArray { capacity, target } => {
            stmt.insert("capacity".to_string(), json!(capacity));
            stmt.insert("target".to_string(), json!(target));
        }
        StatementKind::MakeNumberRef { index, target } => {
            stmt.insert("index".to_string(), json!(index));
            stmt.insert("target".to_string(), json!(target));
        }
        StatementKind::MakeNumberInt { value, target } | StatementKind::AssignInt { value, target } => {
            stmt.insert("value".to_string(), json!(value));
            stmt.insert("target".to_string(), json!(target));
        }
        StatementKind::Len { source, target } => {
            stmt.insert("source".to_string(), operand_json(source));
            stmt.insert("target".to_string(), json!(target));
        }
        StatementKind::IsObject { source }
        | StatementKind::IsArray { source }
        | StatementKind::IsSet { source } => {
            stmt.insert("source".to_string(), operand_json(source));
        }
        StatementKind::AssignVarOnce { source, target }
        | StatementKind::AssignVar { source, target } => {
            stmt.insert("source".to_string(), operand_json(source));
            stmt.insert("target".to_string(), json!(target));
        }
        StatementKind::IsDefined { source }
        | StatementKind::IsUndefined { source }
        | StatementKind::ReturnLocal { source } => {
            stmt.insert("source".to_string(), json!(source));
        }
        StatementKind::ObjectInsert { key, value, object }
        | StatementKind::ObjectInsertOnce { key, value, object } => {
            stmt.insert("key".to_string(), operand_json(key));
            stmt.insert("value".to_string(), operand_json(value));
            stmt.insert("object".to_string(), json!(object));
        }
        StatementKind::ObjectMerge { a, b, target } => {
            stmt.insert("a".to_string(), json!(a));
            stmt.insert("b".to_string(), json!(b));
            stmt.insert("target".to_string(), json!(target));
        }
        StatementKind::ArrayAppend { value, array } => {
            stmt.insert("value".to_string(), operand_json(value));
            stmt.insert("array".to_string(), json!(array));
        }
        StatementKind::SetAdd { value, set } => {
            stmt.insert("value".to_string(), operand_json(value));
            stmt.insert("set".to_string(), json!(set));
        }
        StatementKind::Dot { source, key, target } => {
            stmt.insert("source".to_string(), operand_json(source));
            stmt.insert("key".to_string(), operand_json(key));
            stmt.insert("target".to_string(), json!(target));
        }
        StatementKind::ResultSetAdd { value } => {
            stmt.insert("value".to_string(), json!(value));
        }
        StatementKind::Equal { a, b } | StatementKind::NotEqual { a, b } => {
            stmt.insert("a".to_string(), operand_json(a));
            stmt.insert("b".to_string(), operand_json(b));
        }
        StatementKind::Block { blocks } => {
            stmt.insert("blocks".to_string(), blocks_json(bundle, blocks));
        }
        StatementKind::Call { func, args, result } => {
            stmt.insert("func".to_string(), json!(func));
            stmt.insert("args".to_string(), operands_json(args));
            stmt.insert("result".to_string(), json!(result));
        }
        StatementKind::CallDynamic { path, args, result } => {
            stmt.insert("path".to_string(), operands_json(path));
            stmt.insert("args".to_string(), operands_json(args));
            stmt.insert("result".to_string(), json!(result));
        }
        StatementKind::Not { block } => {
            stmt.insert("block".to_string(), block_json(bundle, block));
        }
        StatementKind::Scan {
            source,
            key,
            value,
            block,
        } => {
            stmt.insert("source".to_string(), json!(source));
            stmt.insert("key".to_string(), json!(key));
            stmt.insert("value".to_string(), json!(value));
            stmt.insert("block".to_string(), block_json(bundle, block));
        }
        StatementKind::With {
            local,
            path,
            value,
            block,
        } => {
            stmt.insert("local".to_string(), json!(local));
            stmt.insert("path".to_string(), json!(path));
            stmt.insert("value".to_string(), operand_json(value));
            stmt.insert("block".to_string(), block_json(bundle, block));
        }
        StatementKind::Break { index } => {
            stmt.insert("index".to_string(), json!(index));
        }
        StatementKind::Nop => (),
    }

    location_fields(bundle, &statement.location, &mut stmt);

    json!({"type": statement.kind.name(), "stmt": Json::Object(stmt)})
}

fn block_json(bundle: &Bundle, block: &Block) -> Json {
    Json::Array(block.iter().map(|s| statement_json(bundle, s)).collect())
}

fn blocks_json(bundle: &Bundle, blocks: &[Block]) -> Json {
    Json::Array(blocks.iter().map(|b| block_json(bundle, b)).collect())
}

fn builtin_type_json(ty: &BuiltinType) -> Json {
    match ty {
        BuiltinType::Any => json!({"type": "any"}),
        BuiltinType::Number => json!({"type": "number"}),
        BuiltinType::String => json!({"type": "string"}),
        BuiltinType::Boolean => json!({"type": "boolean"}),
        BuiltinType::Null => json!({"type": "null"}),
        BuiltinType::DynamicArray(item) => {
            json!({"type": "array", "dynamic": builtin_type_json(item)})
        }
        BuiltinType::StaticArray(items) => {
            json!({"type": "array", "static": items.iter().map(builtin_type_json).collect::<Vec<_>>()})
        }
        BuiltinType::DynamicObject(key, value) => json!({
            "type": "object",
            "dynamic": {"key": builtin_type_json(key), "value": builtin_type_json(value)},
        }),
        BuiltinType::StaticObject(entries) => json!({
            "type": "object",
            "static": entries
                .iter()
                .map(|(k, v)| json!({"key": builtin_type_json(k), "value": builtin_type_json(v)}))
                .collect::<Vec<_>>(),
        }),
        BuiltinType::HybridObject { key, value, entries } => json!({
            "type": "object",
            "dynamic": {"key": builtin_type_json(key), "value": builtin_type_json(value)},
            "static": entries
                .iter()
                .map(|(k, v)| json!({"key": builtin_type_json(k), "value": builtin_type_json(v)}))
                .collect::<Vec<_>>(),
        }),
        BuiltinType::Set(item) => json!({"type": "set", "of": builtin_type_json(item)}),
        BuiltinType::TypeSeq(items) => {
            json!({"type": "any", "of": items.iter().map(builtin_type_json).collect::<Vec<_>>()})
        }
    }
}

fn arg_json(arg: &Arg) -> Json {
    let mut map = Map::new();
    map.insert("name".to_string(), json!(arg.name));
    if !arg.description.is_empty() {
        map.insert("description".to_string(), json!(arg.description));
    }
    map.insert("type".to_string(), builtin_type_json(&arg.ty));
    Json::Object(map)
}

fn decl_json(name: &str, decl: &Decl) -> Json {
    let args = match &decl.args {
        DeclArgs::VarArgs => Json::Null,
        DeclArgs::Args(args) => Json::Array(args.iter().map(arg_json).collect()),
    };
    let result = match &decl.result {
        DeclResult::Void => Json::Null,
        DeclResult::Result(arg) => arg_json(arg),
    };
    json!({"name": name, "decl": {"args": args, "result": result}})
}

impl Bundle {
    /// Render the bundle as its JSON document.
    pub fn to_json(&self) -> Result<Json> {
        let files: Vec<Json> = self
            .files
            .iter()
            .map(|f| json!({"name": f.file(), "contents": f.contents()}))
            .collect();
        let builtin_funcs: Vec<Json> = self
            .builtin_funcs
            .iter()
            .map(|(name, decl)| decl_json(name, decl))
            .collect();
        let plans: Vec<Json> = self
            .plans
            .iter()
            .map(|p| json!({"name": p.name, "blocks": blocks_json(self, &p.blocks)}))
            .collect();
        let funcs: Vec<Json> = self
            .functions
            .iter()
            .map(|f| {
                json!({
                    "name": f.name,
                    "path": f.path,
                    "params": f.parameters,
                    "return": f.result,
                    "blocks": blocks_json(self, &f.blocks),
                })
            })
            .collect();

        let mut plan = Map::new();
        plan.insert(
            "static".to_string(),
            json!({
                "strings": self.strings.iter().map(|s| json!({"value": s})).collect::<Vec<_>>(),
                "files": files,
                "builtin_funcs": builtin_funcs,
            }),
        );
        plan.insert("plans".to_string(), json!({"plans": plans}));
        plan.insert("funcs".to_string(), json!({"funcs": funcs}));
        if let Some(query) = &self.query {
            plan.insert("query".to_string(), json!(query.contents()));
        }

        Ok(json!({
            "data": serde_json::to_value(&self.data)?,
            "plan": Json::Object(plan),
        }))
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_json()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Plan;

    #[test]
    fn renders_statement_shapes() {
        let mut bundle = Bundle {
            strings: vec!["result".to_string()],
            ..Bundle::default()
        };
        bundle.plans.push(Plan {
            name: "q".to_string(),
            blocks: vec![vec![
                Statement::new(StatementKind::MakeObject { target: 2 }),
                Statement::new(StatementKind::ObjectInsert {
                    key: Operand::String(0),
                    value: Operand::Local(3),
                    object: 2,
                }),
                Statement::new(StatementKind::ResultSetAdd { value: 2 }),
            ]],
        });
        let json = bundle.to_json().unwrap();
        let stmts = &json["plan"]["plans"]["plans"][0]["blocks"][0];
        assert_eq!(stmts[0]["type"], "MakeObjectStmt");
        assert_eq!(stmts[1]["stmt"]["key"]["type"], "string_index");
        assert_eq!(stmts[2]["type"], "ResultSetAddStmt");
    }
}
