// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bundle format properties: round-trips, CRC integrity, JSON form.

use regobund::{Bundle, Interpreter, Value};

fn compiled_bundle() -> Bundle {
    let mut rego = Interpreter::new();
    rego.add_module(
        "policy.rego",
        "package p\n\nimport rego.v1\n\ndefault allow := false\n\nallow if input.role == \"admin\"\n\ng contains x if { some x in [1, 2, 3]; x > 1 }",
    )
    .unwrap();
    rego.add_data_json(r#"{"config": {"port": 8080, "ratio": 2.5, "name": "api", "on": true, "off": null}}"#)
        .unwrap();
    rego.compile_query("data.p.allow").unwrap()
}

#[test]
fn binary_round_trip_preserves_structure() {
    let bundle = compiled_bundle();
    let bytes = bundle.to_bytes().unwrap();
    let loaded = Bundle::from_bytes(&bytes).unwrap();
    assert_eq!(bundle, loaded);
    // A second save of the loaded bundle is byte-identical.
    assert_eq!(bytes, loaded.to_bytes().unwrap());
}

#[test]
fn round_tripped_bundles_evaluate_identically() {
    let bundle = compiled_bundle();
    let loaded = Bundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap();

    let mut rego = Interpreter::new();
    rego.set_input_json(r#"{"role": "admin"}"#).unwrap();
    let direct = rego.query_bundle(&bundle).unwrap();
    let reloaded = rego.query_bundle(&loaded).unwrap();
    assert_eq!(direct, reloaded);
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0]["result"], Value::Bool(true));
}

#[test]
fn every_payload_byte_flip_is_detected() {
    let bundle = compiled_bundle();
    let bytes = bundle.to_bytes().unwrap();
    // The payload begins after the 64-byte header.
    for offset in (64..bytes.len()).step_by(11) {
        let mut corrupt = bytes.clone();
        corrupt[offset] ^= 0x01;
        assert!(
            Bundle::from_bytes(&corrupt).is_err(),
            "flip at offset {offset} went undetected"
        );
    }
}

#[test]
fn header_versions_gate_loading() {
    let bundle = compiled_bundle();
    let mut bytes = bundle.to_bytes().unwrap();
    bytes[8] = 2;
    let err = Bundle::from_bytes(&bytes).unwrap_err().to_string();
    assert!(err.contains("unsupported rego version"));

    let mut bytes = bundle.to_bytes().unwrap();
    bytes[9] = 2;
    let err = Bundle::from_bytes(&bytes).unwrap_err().to_string();
    assert!(err.contains("unsupported rego binary version"));
}

#[test]
fn save_and_load_files() {
    let bundle = compiled_bundle();
    let dir = std::env::temp_dir();
    let path = dir.join(format!("regobund-test-{}.bin", std::process::id()));
    bundle.save(&path).unwrap();
    let loaded = Bundle::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(bundle, loaded);
}

#[test]
fn lookup_tables_survive_round_trips() {
    let bundle = compiled_bundle();
    let loaded = Bundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap();
    assert!(loaded.find_plan("p/allow").is_some());
    assert!(loaded.find_function("g0.data.p.allow").is_some());
    assert!(loaded.find_function("g0.data.p.g").is_some());
    assert!(loaded.is_function("g0.data.p.allow"));
    assert_eq!(loaded.query_plan, bundle.query_plan);
    assert_eq!(loaded.local_count, bundle.local_count);
}

#[test]
fn json_form_has_the_documented_shape() {
    let bundle = compiled_bundle();
    let json = bundle.to_json().unwrap();
    assert!(json["data"]["config"]["port"].is_number());
    assert!(json["plan"]["static"]["strings"].is_array());
    assert!(json["plan"]["static"]["files"].is_array());
    assert!(json["plan"]["static"]["builtin_funcs"].is_array());
    assert!(json["plan"]["plans"]["plans"].is_array());
    assert!(json["plan"]["funcs"]["funcs"].is_array());
    assert_eq!(json["plan"]["query"], "data.p.allow");

    // Statements carry the documented tagging.
    let first_plan = &json["plan"]["plans"]["plans"][0]["blocks"][0][0];
    assert!(first_plan["type"].as_str().unwrap().ends_with("Stmt"));
    assert!(first_plan["stmt"].is_object());
}

#[test]
fn numbers_keep_precision_end_to_end() {
    // An integer beyond 64 bits survives compilation, the binary bundle and
    // evaluation as its exact decimal text.
    let big = "123456789012345678901234567890";
    let mut rego = Interpreter::new();
    rego.add_module("policy.rego", &format!("package p\nbig := {big}"))
        .unwrap();
    let bundle = rego.compile_query("data.p.big").unwrap();
    let loaded = Bundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap();

    let results = rego.query_bundle(&loaded).unwrap();
    assert_eq!(serde_json::to_string(&results[0]["result"]).unwrap(), big);

    // The same holds for numbers in the data document.
    let mut rego = Interpreter::new();
    rego.add_module("policy.rego", "package p\nbig := data.big").unwrap();
    rego.add_data_json(&format!(r#"{{"big": {big}}}"#)).unwrap();
    let bundle = rego.compile_query("data.p.big").unwrap();
    let loaded = Bundle::from_bytes(&bundle.to_bytes().unwrap()).unwrap();
    let results = rego.query_bundle(&loaded).unwrap();
    assert_eq!(serde_json::to_string(&results[0]["result"]).unwrap(), big);
}
