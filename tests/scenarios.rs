// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end scenarios: modules + data + input + query → result set.

use anyhow::Result;
use regobund::Interpreter;

fn eval(modules: &[&str], data: &str, input: &str, query: &str) -> Result<serde_json::Value> {
    let mut rego = Interpreter::new();
    for (i, module) in modules.iter().enumerate() {
        rego.add_module(&format!("policy{i}.rego"), module)?;
    }
    rego.add_data_json(data)?;
    rego.set_input_json(input)?;
    let results = rego.query(query)?;
    Ok(serde_json::from_str(&results)?)
}

fn assert_result(modules: &[&str], data: &str, input: &str, query: &str, expected: &str) {
    let actual = eval(modules, data, input, query).expect("evaluation failed");
    let expected: serde_json::Value = serde_json::from_str(expected).expect("expected json");
    assert_eq!(actual, expected, "query {query}");
}

#[test]
fn complete_rule() {
    assert_result(
        &["package p\nallow := true"],
        "{}",
        "{}",
        "data.p.allow",
        r#"[{"result":true}]"#,
    );
}

#[test]
fn partial_set_accumulates_across_definitions() {
    assert_result(
        &["package p\nr[x] { x := 1 }\nr[x] { x := 2 }"],
        "{}",
        "{}",
        "data.p.r",
        r#"[{"result":[1,2]}]"#,
    );
}

#[test]
fn function_rule() {
    assert_result(
        &["package p\nf(x) := x * 2"],
        "{}",
        "{}",
        "data.p.f(21)",
        r#"[{"result":42}]"#,
    );
}

#[test]
fn input_comparison() {
    assert_result(
        &["package p\nallow { input.role == \"admin\" }"],
        "{}",
        r#"{"role":"admin"}"#,
        "data.p.allow",
        r#"[{"result":true}]"#,
    );
}

#[test]
fn with_on_rule_head() {
    assert_result(
        &["package p\nv := 1 with input as {\"x\": 2}"],
        "{}",
        "{}",
        "data.p.v",
        r#"[{"result":1}]"#,
    );
}

#[test]
fn some_in_iteration() {
    assert_result(
        &["package p\ng contains x if { some x in [1, 2, 3]; x > 1 }"],
        "{}",
        "{}",
        "data.p.g",
        r#"[{"result":[2,3]}]"#,
    );
}

#[test]
fn undefined_rules_produce_no_results() {
    assert_result(
        &["package p\nallow { input.role == \"admin\" }"],
        "{}",
        r#"{"role":"user"}"#,
        "data.p.allow",
        "[]",
    );
}

#[test]
fn default_rules_fill_in() {
    assert_result(
        &["package p\ndefault allow := false\nallow { input.role == \"admin\" }"],
        "{}",
        r#"{"role":"user"}"#,
        "data.p.allow",
        r#"[{"result":false}]"#,
    );
}

#[test]
fn else_chains_take_the_first_success() {
    let module = "package p\nlevel := 1 {\n input.a\n} else := 2 {\n input.b\n} else := 3 {\n true\n}";
    assert_result(
        &[module],
        "{}",
        r#"{"b": true}"#,
        "data.p.level",
        r#"[{"result":2}]"#,
    );
    assert_result(&[module], "{}", "{}", "data.p.level", r#"[{"result":3}]"#);
}

#[test]
fn base_document_lookup() {
    assert_result(
        &["package p\nport := data.config.port"],
        r#"{"config": {"port": 8080}}"#,
        "{}",
        "data.p.port",
        r#"[{"result":8080}]"#,
    );
}

#[test]
fn partial_object_rule() {
    assert_result(
        &["package p\nages[k] := v { some k, v in {\"ann\": 40, \"bob\": 41} }"],
        "{}",
        "{}",
        "data.p.ages",
        r#"[{"result":{"ann":40,"bob":41}}]"#,
    );
}

#[test]
fn comprehension_values() {
    assert_result(
        &["package p\ndoubled := [x * 2 | some x in [1, 2, 3]]"],
        "{}",
        "{}",
        "data.p.doubled",
        r#"[{"result":[2,4,6]}]"#,
    );
}

#[test]
fn every_quantifier() {
    let module =
        "package p\nimport rego.v1\nall_even if { every x in input.xs { x % 2 == 0 } }";
    assert_result(
        &[module],
        "{}",
        r#"{"xs": [2, 4, 6]}"#,
        "data.p.all_even",
        r#"[{"result":true}]"#,
    );
    assert_result(&[module], "{}", r#"{"xs": [2, 3]}"#, "data.p.all_even", "[]");
    // Every over an empty domain holds.
    assert_result(
        &[module],
        "{}",
        r#"{"xs": []}"#,
        "data.p.all_even",
        r#"[{"result":true}]"#,
    );
}

#[test]
fn negation() {
    let module = "package p\nallow { not input.banned }";
    assert_result(&[module], "{}", "{}", "data.p.allow", r#"[{"result":true}]"#);
    assert_result(
        &[module],
        "{}",
        r#"{"banned": true}"#,
        "data.p.allow",
        "[]",
    );
}

#[test]
fn unification_is_symmetric() {
    // `x = 1` and `1 = x` produce identical assignments.
    let lhs = eval(
        &["package p\nq := x { x = 1 }"],
        "{}",
        "{}",
        "data.p.q",
    )
    .unwrap();
    let rhs = eval(
        &["package p\nq := x { 1 = x }"],
        "{}",
        "{}",
        "data.p.q",
    )
    .unwrap();
    assert_eq!(lhs, rhs);
    assert_eq!(lhs, serde_json::json!([{"result": 1}]));
}

#[test]
fn with_composition_on_disjoint_paths_commutes() {
    // W1 then W2 on disjoint paths equals W2 then W1.
    let forward = eval(
        &["package p\nv := [input.a, input.b] with input.a as 1 with input.b as 2"],
        "{}",
        r#"{"a": 0, "b": 0}"#,
        "data.p.v",
    )
    .unwrap();
    let reverse = eval(
        &["package p\nv := [input.a, input.b] with input.b as 2 with input.a as 1"],
        "{}",
        r#"{"a": 0, "b": 0}"#,
        "data.p.v",
    )
    .unwrap();
    assert_eq!(forward, reverse);
    assert_eq!(forward, serde_json::json!([{"result": [1, 2]}]));
}

#[test]
fn with_override_of_a_rule() {
    assert_result(
        &[
            "package p\nthreshold := 10\nok { input.n < threshold }",
        ],
        "{}",
        r#"{"n": 50}"#,
        "data.p.ok with data.p.threshold as 100",
        r#"[{"result":true}]"#,
    );
}

#[test]
fn with_override_of_base_data_reaches_callees() {
    assert_result(
        &["package p\nlimit := data.config.limit\ncheck { input.n <= limit }"],
        r#"{"config": {"limit": 1}}"#,
        r#"{"n": 5}"#,
        "data.p.check with data.config.limit as 10",
        r#"[{"result":true}]"#,
    );
}

#[test]
fn strict_mode_rejects_input_shadowing() {
    let mut rego = Interpreter::new();
    rego.add_module(
        "policy.rego",
        "package p\nimport rego.v1\np if { input := 1 }",
    )
    .unwrap();
    let err = rego.query("data.p.p").unwrap_err().to_string();
    assert!(err.contains("rego_compile_error"), "{err}");
}

#[test]
fn deterministic_output() {
    let modules = ["package p\nr contains x if { some x in input.xs }"];
    let input = r#"{"xs": ["c", "a", "b", "a"]}"#;
    let first = eval(&modules, "{}", input, "data.p.r").unwrap();
    let second = eval(&modules, "{}", input, "data.p.r").unwrap();
    assert_eq!(first, second);
    // Sets render in canonical order.
    assert_eq!(first, serde_json::json!([{"result": ["a", "b", "c"]}]));
}

#[test]
fn query_bindings() {
    let mut rego = Interpreter::new();
    rego.add_module("policy.rego", "package p\nvalues := [10, 20]").unwrap();
    let output = rego.raw_query("some x in data.p.values").unwrap();
    assert_eq!(output.result.len(), 2);
    let bound: Vec<String> = output
        .result
        .iter()
        .map(|r| r.bindings["x"].to_string())
        .collect();
    assert_eq!(bound, vec!["10", "20"]);
}

#[test]
fn rules_spanning_packages() {
    assert_result(
        &[
            "package a\nx := 1",
            "package b\ny := data.a.x + 1",
        ],
        "{}",
        "{}",
        "data.b.y",
        r#"[{"result":2}]"#,
    );
}

#[test]
fn destructuring_unification() {
    assert_result(
        &["package p\nq := [a, b] { [a, b] = input.pair }"],
        "{}",
        r#"{"pair": [1, 2]}"#,
        "data.p.q",
        r#"[{"result":[1,2]}]"#,
    );
}
