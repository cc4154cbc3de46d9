use std::path::PathBuf;

use pons_bridge::{load_module_manifest, parse_module_manifest, Ty};

fn write_manifest(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("pons.json");
    std::fs::write(&path, body).unwrap();
    path
}

fn parse_err(body: &str) -> String {
    let err = parse_module_manifest(body).unwrap_err();
    format!("{err:#}")
}

#[test]
fn manifests_load_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_manifest(
        &dir,
        r#"{
          "schema_version": "pons.module@0.1.0",
          "abi_major": 1,
          "module": "atlas",
          "decls": [
            {"owner": "Tile", "member": "shade", "params": ["u8"], "result": "u8"},
            {"member": "walk", "params": [{"closure": {"params": ["str"], "ret": "unit"}}], "result": "unit"}
          ],
          "variants": [
            {"name": "Edge", "cases": [{"name": "open"}, {"name": "wall", "payload": ["u8"]}]}
          ],
          "errors": [
            {"type_tag": "atlas.lost", "payload": "str"}
          ]
        }"#,
    );
    let manifest = load_module_manifest(&path).unwrap();
    assert_eq!(manifest.module, "atlas");
    assert_eq!(manifest.decls.len(), 2);

    let shade = &manifest.decls[0];
    assert_eq!(shade.module, "atlas");
    assert_eq!(shade.owner, "Tile");
    assert!(!shade.throws && !shade.is_async && !shade.streaming);

    let walk = &manifest.decls[1];
    assert!(walk.owner.is_empty());
    assert_eq!(
        walk.params[0],
        Ty::Closure {
            params: vec![Ty::Str],
            ret: Box::new(Ty::Unit),
        }
    );
    assert_eq!(walk.result, Ty::Unit);

    assert_eq!(manifest.variants[0].cases[0].payload, Vec::<Ty>::new());
    assert_eq!(manifest.errors[0].type_tag, "atlas.lost");
}

#[test]
fn missing_files_name_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = load_module_manifest(&path).unwrap_err();
    let text = format!("{err:#}");
    assert!(text.contains("read module manifest"), "got: {text}");
    assert!(text.contains("absent.json"), "got: {text}");
}

#[test]
fn schema_drift_is_rejected() {
    let text = parse_err(
        r#"{"schema_version": "pons.module@9.9.9", "abi_major": 1, "module": "m"}"#,
    );
    assert!(
        text.contains("unsupported module manifest schema_version"),
        "got: {text}"
    );
}

#[test]
fn abi_drift_is_rejected() {
    let text = parse_err(
        r#"{"schema_version": "pons.module@0.1.0", "abi_major": 99, "module": "m"}"#,
    );
    assert!(
        text.contains("abi_major 99 does not match runtime abi 1"),
        "got: {text}"
    );
}

#[test]
fn unknown_fields_are_rejected() {
    let text = parse_err(
        r#"{
          "schema_version": "pons.module@0.1.0",
          "abi_major": 1,
          "module": "m",
          "decls": [{"member": "f", "result": "unit", "color": "red"}]
        }"#,
    );
    assert!(text.contains("unknown field"), "got: {text}");
    assert!(text.contains("color"), "got: {text}");
}

#[test]
fn dotted_module_names_are_rejected() {
    let text = parse_err(
        r#"{"schema_version": "pons.module@0.1.0", "abi_major": 1, "module": "geo.ext"}"#,
    );
    assert!(text.contains("invalid module name 'geo.ext'"), "got: {text}");
}

#[test]
fn streaming_requires_async() {
    let text = parse_err(
        r#"{
          "schema_version": "pons.module@0.1.0",
          "abi_major": 1,
          "module": "m",
          "decls": [{"member": "feed", "result": "i64", "streaming": true}]
        }"#,
    );
    assert!(text.contains("streaming but not async"), "got: {text}");
}

#[test]
fn unit_is_a_result_only_type() {
    let text = parse_err(
        r#"{
          "schema_version": "pons.module@0.1.0",
          "abi_major": 1,
          "module": "m",
          "decls": [{"member": "f", "params": ["unit"], "result": "unit"}]
        }"#,
    );
    assert!(
        text.contains("unit is only valid in result position"),
        "got: {text}"
    );
    assert!(text.contains("parameter of 'm.f'"), "got: {text}");
}

#[test]
fn declared_foreign_tags_are_plain_identifiers() {
    let text = parse_err(
        r#"{
          "schema_version": "pons.module@0.1.0",
          "abi_major": 1,
          "module": "m",
          "decls": [{"member": "f", "params": [{"foreign": "a.b"}], "result": "unit"}]
        }"#,
    );
    assert!(text.contains("invalid bridged type tag 'a.b'"), "got: {text}");
}

#[test]
fn duplicate_entry_symbols_are_rejected() {
    let text = parse_err(
        r#"{
          "schema_version": "pons.module@0.1.0",
          "abi_major": 1,
          "module": "m",
          "decls": [
            {"member": "f", "params": ["i64"], "result": "unit"},
            {"member": "f", "params": ["i64"], "result": "unit"}
          ]
        }"#,
    );
    assert!(text.contains("duplicate entry symbol"), "got: {text}");
}

#[test]
fn runtime_reserved_error_tags_are_rejected() {
    let text = parse_err(
        r#"{
          "schema_version": "pons.module@0.1.0",
          "abi_major": 1,
          "module": "m",
          "errors": [{"type_tag": "pons.oops", "payload": "str"}]
        }"#,
    );
    assert!(text.contains("reserved for the bridge runtime"), "got: {text}");
}

#[test]
fn decls_may_not_claim_another_module() {
    let text = parse_err(
        r#"{
          "schema_version": "pons.module@0.1.0",
          "abi_major": 1,
          "module": "m",
          "decls": [{"module": "other", "member": "f", "result": "unit"}]
        }"#,
    );
    assert!(
        text.contains("does not belong to module 'm'"),
        "got: {text}"
    );
}
