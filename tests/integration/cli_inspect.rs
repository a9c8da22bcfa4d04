#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn init_dir() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("sombra-records")
        .arg("init")
        .arg(dir.path())
        .assert()
        .success();
    dir
}

fn json(args: &[&str], dir: &Path, trailing: &[&str]) -> Value {
    let output = cargo_bin_cmd!("sombra-records")
        .args(["--format", "json"])
        .args(args)
        .arg(dir)
        .args(trailing)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

fn field<'a>(fields: &'a Value, name: &str) -> &'a Value {
    fields
        .as_array()
        .expect("field array")
        .iter()
        .find(|entry| entry["field"] == name)
        .map(|entry| &entry["value"])
        .expect("field present")
}

#[test]
fn init_reports_every_store() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("sombra-records")
        .arg("init")
        .arg(dir.path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8 output");
    assert!(text.starts_with("initialized"));
    assert!(text.contains("NodeStore"));
    assert!(text.contains("17 byte records"));
    assert!(dir.path().join("neostore").exists());
    assert!(dir.path().join("neostore.nodestore.db.id").exists());
}

#[test]
fn meta_prints_fields_as_json() {
    let dir = init_dir();
    let fields = json(&["meta"], dir.path(), &[]);
    assert_eq!(fields.as_array().map(Vec::len), Some(13));
    assert!(field(&fields, "time").as_i64().unwrap_or_default() > 0);
    assert_eq!(field(&fields, "log_version"), 0);
    assert_eq!(field(&fields, "first_graph_property"), -1);
}

#[test]
fn set_field_is_visible_to_meta() {
    let dir = init_dir();
    let changed = json(&["set-field"], dir.path(), &["log_version", "9"]);
    assert_eq!(changed["previous"], 0);
    assert_eq!(changed["value"], 9);

    let fields = json(&["meta"], dir.path(), &[]);
    assert_eq!(field(&fields, "log_version"), 9);

    cargo_bin_cmd!("sombra-records")
        .arg("set-field")
        .arg(dir.path())
        .args(["no_such_field", "1"])
        .assert()
        .failure();
}

#[test]
fn strings_round_trip_through_the_cli() {
    let dir = init_dir();
    let put = json(&["put-string"], dir.path(), &["stored through the cli"]);
    let id = put["id"].as_i64().expect("id");

    let output = cargo_bin_cmd!("sombra-records")
        .arg("get-string")
        .arg(dir.path())
        .arg(id.to_string())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(
        String::from_utf8(output).expect("utf8 output").trim_end(),
        "stored through the cli"
    );

    let records = json(
        &["dump", "--store", "string", "--id", &id.to_string(), "--count", "2"],
        dir.path(),
        &[],
    );
    let records = records.as_array().expect("record array");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], id);
    assert_eq!(records[0]["in_use"], true);
    assert!(!records[0]["hex"].as_str().unwrap_or_default().is_empty());
}

#[test]
fn ids_lists_every_store() {
    let dir = init_dir();
    let summaries = json(&["ids"], dir.path(), &[]);
    let summaries = summaries.as_array().expect("summary array");
    assert_eq!(summaries.len(), 5);
    let node = summaries
        .iter()
        .find(|summary| summary["store"] == "node")
        .expect("node summary");
    assert_eq!(node["record_size"], 17);
    assert_eq!(node["reserved_records"], 2);
    assert_eq!(node["high_id"], 2);
}

#[test]
fn missing_directory_fails_cleanly() {
    let dir = TempDir::new().expect("tempdir");
    let output = cargo_bin_cmd!("sombra-records")
        .arg("meta")
        .arg(dir.path().join("nowhere"))
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("error:"));
}
