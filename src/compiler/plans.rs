// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The *add_plans* pass: one entry-point plan per document rule, plus a
//! plan for the ad-hoc query. Each plan calls the rule's function, wraps
//! the value in a `{"result": …}` object and emits it via `ResultSetAdd`;
//! the query plan scans the array returned by the synthetic query function
//! and emits one object per element.

use super::{CompileCtx, RuleKind};
use crate::bundle::{Block, Bundle, Operand, Plan, Statement, StatementKind};

pub fn add_plans(ctx: &mut CompileCtx, bundle: &mut Bundle) {
    let result_key = ctx.intern("result");

    let rules: Vec<(String, Vec<String>, RuleKind, String)> = ctx
        .rules
        .values()
        .map(|r| (r.ident.clone(), r.path.clone(), r.kind.clone(), r.prefix.clone()))
        .collect();

    let mut next_local = 2;
    let mut temp = || {
        let slot = next_local;
        next_local += 1;
        slot
    };

    for (ident, path, kind, prefix) in rules {
        // Clones are internal; functions have no document entry point.
        if prefix != "g0" && kind != RuleKind::Query {
            continue;
        }
        if kind == RuleKind::Function {
            continue;
        }

        if kind == RuleKind::Query {
            let value = temp();
            let key = temp();
            let element = temp();
            let object = temp();
            let block: Block = vec![
                Statement::new(StatementKind::Call {
                    func: format!("{prefix}.{ident}"),
                    args: vec![Operand::Local(0), Operand::Local(1)],
                    result: value,
                }),
                Statement::new(StatementKind::Scan {
                    source: value,
                    key,
                    value: element,
                    block: vec![
                        Statement::new(StatementKind::MakeObject { target: object }),
                        Statement::new(StatementKind::ObjectInsert {
                            key: Operand::String(result_key),
                            value: Operand::Local(element),
                            object,
                        }),
                        Statement::new(StatementKind::ResultSetAdd { value: object }),
                    ],
                }),
            ];
            let index = bundle.plans.len();
            bundle.name_to_plan.insert(ident.clone(), index);
            bundle.query_plan = Some(index);
            bundle.plans.push(Plan {
                name: ident,
                blocks: vec![block],
            });
            continue;
        }

        let name = path[1..].join("/");
        let value = temp();
        let object = temp();
        let block: Block = vec![
            Statement::new(StatementKind::Call {
                func: format!("g0.{ident}"),
                args: vec![Operand::Local(0), Operand::Local(1)],
                result: value,
            }),
            Statement::new(StatementKind::IsDefined { source: value }),
            Statement::new(StatementKind::MakeObject { target: object }),
            Statement::new(StatementKind::ObjectInsert {
                key: Operand::String(result_key),
                value: Operand::Local(value),
                object,
            }),
            Statement::new(StatementKind::ResultSetAdd { value: object }),
        ];
        let index = bundle.plans.len();
        bundle.name_to_plan.insert(name.clone(), index);
        bundle.plans.push(Plan {
            name,
            blocks: vec![block],
        });
    }

    bundle.local_count = bundle.local_count.max(next_local);
}
