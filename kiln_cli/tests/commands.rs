mod common;

use common::kiln_cmd;
use common::write_file;
use kiln_core::AnyEmptyResult;
use predicates::str::contains;
use similar_asserts::assert_eq;

const CONFIG: &str = r#"
template_roots = ["templates"]

[functions]
order = ["scripts", "native"]

[[steps]]
name = "reflect"
input = "schema/*.json"
templates = ["reflect.gen.h.j2"]
scripts = ["helpers.j2"]
"#;

const HELPERS: &str = concat!(
	"{% macro guard(name) %}{{ screaming_snake_case(name) }}_H{% endmacro %}\n",
	"{% macro upper(text) %}{{ text }}!{% endmacro %}\n",
);

#[test]
fn functions_lists_native_catalog() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;

	kiln_cmd()
		.arg("functions")
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.success()
		.stdout(contains("snake_case"))
		.stdout(contains("embed_bytes"))
		.stdout(contains("native"));

	Ok(())
}

#[test]
fn functions_for_a_step_follow_backend_order() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "kiln.toml", CONFIG)?;
	write_file(tmp.path(), "templates/helpers.j2", HELPERS)?;

	let output = kiln_cmd()
		.args(["functions", "--step", "reflect", "--format", "json"])
		.arg("--path")
		.arg(tmp.path())
		.output()?;
	assert!(output.status.success());

	let functions: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)?;
	let backend = |name: &str| {
		functions
			.iter()
			.find(|entry| entry["name"] == name)
			.map(|entry| entry["backend"].clone())
	};

	assert_eq!(backend("guard"), Some(serde_json::json!("scripts")));
	assert_eq!(backend("upper"), Some(serde_json::json!("scripts")));
	assert_eq!(backend("lower"), Some(serde_json::json!("native")));
	assert_eq!(backend("nonexistent"), None);

	Ok(())
}

#[test]
fn functions_for_unknown_step_fail() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "kiln.toml", CONFIG)?;

	kiln_cmd()
		.args(["functions", "--step", "missing"])
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.code(2)
		.stderr(contains("no step named"));

	Ok(())
}

#[test]
fn cache_reports_missing_file() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;

	kiln_cmd()
		.arg("cache")
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.success()
		.stdout(contains("Exists           false"))
		.stdout(contains("Entries          0"));

	Ok(())
}

#[test]
fn cache_reports_entries_after_a_run() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "kiln.toml", CONFIG)?;
	write_file(tmp.path(), "templates/helpers.j2", HELPERS)?;
	write_file(tmp.path(), "templates/reflect.gen.h.j2", "{{ guard(name) }}")?;
	write_file(tmp.path(), "schema/shapes.json", "{}")?;

	kiln_cmd().arg("--path").arg(tmp.path()).assert().success();
	let header = std::fs::read_to_string(tmp.path().join("generated/shapes.gen.h"))?;
	assert_eq!(header, "SHAPES_H");

	let output = kiln_cmd()
		.args(["cache", "--format", "json"])
		.arg("--path")
		.arg(tmp.path())
		.output()?;
	assert!(output.status.success());

	let inspection: serde_json::Value = serde_json::from_slice(&output.stdout)?;
	assert_eq!(inspection["exists"], serde_json::json!(true));
	assert_eq!(inspection["valid"], serde_json::json!(true));
	// The template, the script and the input.
	assert_eq!(inspection["entry_count"], serde_json::json!(3));

	Ok(())
}

#[test]
fn cache_reports_foreign_versions() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	write_file(
		tmp.path(),
		".kiln/cache.json",
		r#"{ "schema_version": 99, "tool_version": "0.0.1", "entries": [] }"#,
	)?;

	kiln_cmd()
		.arg("cache")
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.success()
		.stdout(contains("Valid            false"))
		.stdout(contains("will be rebuilt"));

	Ok(())
}
