use super::*;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should be monotonic")
        .as_nanos();
    std::env::temp_dir().join(format!("procengine-rs-{}-{}", name, nanos))
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent should be created");
    }
    fs::write(path, content).expect("file should be written");
}

fn demo_dir() -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("demos")
        .join("inventory")
        .to_string_lossy()
        .to_string()
}

#[test]
fn load_definitions_merges_every_json_file_in_order() {
    let definitions = load_definitions(&demo_dir()).expect("demo definitions");
    assert_eq!(
        definitions.pools.keys().cloned().collect::<Vec<_>>(),
        vec!["stock".to_string()]
    );
    assert_eq!(definitions.procedures[0].id, "inventory/add");
    assert_eq!(definitions.procedures.len(), 4);
}

#[test]
fn resolve_definitions_path_reports_missing_paths() {
    let missing = temp_path("missing");
    let error = resolve_definitions_path(missing.to_string_lossy().as_ref())
        .expect_err("missing path should fail");
    assert_eq!(error.code, "CLI_SOURCE_NOT_FOUND");
}

#[test]
fn collect_definition_files_skips_other_extensions() {
    let root = temp_path("collect");
    write_file(&root.join("b.json"), "{}");
    write_file(&root.join("nested").join("a.json"), "{}");
    write_file(&root.join("notes.txt"), "ignored");

    let files = collect_definition_files(&root).expect("files");
    let names = files
        .iter()
        .map(|file| {
            file.strip_prefix(&root)
                .expect("under root")
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["b.json".to_string(), "nested/a.json".to_string()]);

    let empty = temp_path("empty");
    fs::create_dir_all(&empty).expect("empty dir");
    let error = collect_definition_files(&empty).expect_err("no json files");
    assert_eq!(error.code, "CLI_SOURCE_EMPTY");
}

#[test]
fn duplicate_procedures_across_files_are_rejected() {
    let root = temp_path("duplicates");
    let body = r#"{"procedures":[{"id":"p","bindings":[
        {"name":"code","kind":"data","value":"return 1;"}]}]}"#;
    write_file(&root.join("a.json"), body);
    write_file(&root.join("b.json"), body);
    let error = load_definitions(root.to_string_lossy().as_ref()).expect_err("duplicate");
    assert_eq!(error.code, "POOL_CONFIG");
    assert!(error.message.contains("b.json"));
}

#[test]
fn arguments_parse_as_json() {
    let values = parse_positional(&["1".to_string(), "\"x\"".to_string(), "\"@5\"".to_string()])
        .expect("positional");
    assert_eq!(values[0], Value::Int(1));
    assert_eq!(values[1], Value::from("x"));
    assert_eq!(Some(values[2].clone()), Value::timestamp_millis(5));

    let error = parse_positional(&["nope".to_string()]).expect_err("bare word");
    assert_eq!(error.code, "CLI_ARG_INVALID");

    let named = parse_named(&["b=2".to_string(), "a=[1]".to_string()]).expect("named");
    assert_eq!(named.get("b"), Some(&Value::Int(2)));
    assert_eq!(named.get("a"), Some(&Value::List(vec![Value::Int(1)])));
    assert!(parse_named(&["missing-equals".to_string()]).is_err());
}

#[test]
fn run_cli_returns_exit_codes() {
    let dir = demo_dir();
    assert_eq!(
        run_cli_from_args([
            "pe-cli", "run", "--definitions", dir.as_str(), "--procedure", "inventory/add",
            "--arg", "2",
        ]),
        0
    );
    assert_eq!(
        run_cli_from_args([
            "pe-cli", "run", "--definitions", dir.as_str(), "--procedure", "inventory/missing",
        ]),
        1
    );
    assert_eq!(
        run_cli_from_args(["pe-cli", "check", "--definitions", dir.as_str()]),
        0
    );
    assert_eq!(
        run_cli_from_args(["pe-cli", "list", "--definitions", dir.as_str()]),
        0
    );
    assert_eq!(run_cli_from_args(["pe-cli", "bogus"]), 2);
}

#[test]
fn check_fails_for_broken_bodies() {
    let root = temp_path("broken");
    write_file(
        &root.join("broken.json"),
        r#"{"procedures":[{"id":"broken","bindings":[
            {"name":"code","kind":"data","value":"return (;"}]}]}"#,
    );
    let path = root.to_string_lossy().to_string();
    assert_eq!(
        run_cli_from_args(["pe-cli", "check", "--definitions", path.as_str()]),
        1
    );
}
