mod common;

use std::path::Path;

use common::kiln_cmd;
use common::write_file;
use kiln_core::AnyEmptyResult;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use rstest::rstest;
use similar_asserts::assert_eq;

const CONFIG: &str = r#"
template_roots = ["templates"]

[[steps]]
name = "reflect"
input = "schema/**/*.json"
templates = ["reflect.gen.h.j2"]
"#;

const TEMPLATE: &str =
	"// {{ name }}\n{% for m in members %}struct {{ pascal_case(m.name) }};\n{% endfor %}";

fn shapes_project(root: &Path) -> AnyEmptyResult {
	write_file(root, "kiln.toml", CONFIG)?;
	write_file(
		root,
		"schema/shapes.json",
		r#"{ "members": [{ "kind": "class", "name": "circle_shape" }] }"#,
	)?;
	write_file(root, "templates/reflect.gen.h.j2", TEMPLATE)?;
	Ok(())
}

#[test]
fn run_renders_every_step() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.success()
		.stdout(contains("reflect: 1 rendered, 0 unchanged"))
		.stdout(contains("wrote generated/shapes.gen.h"));

	let content = std::fs::read_to_string(tmp.path().join("generated/shapes.gen.h"))?;
	assert_eq!(content, "// shapes\nstruct CircleShape;\n");
	assert!(tmp.path().join(".kiln/cache.json").is_file());

	Ok(())
}

#[test]
fn second_run_is_up_to_date() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;

	kiln_cmd().arg("run").arg("--path").arg(tmp.path()).assert().success();

	kiln_cmd()
		.arg("run")
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.success()
		.stdout(contains("reflect: 0 rendered, 1 unchanged"))
		.stdout(contains("Everything is up to date."));

	kiln_cmd()
		.arg("--force")
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.success()
		.stdout(contains("reflect: 1 rendered"));

	Ok(())
}

#[test]
fn command_line_overrides_output_and_cache() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.args(["-o", "out", "--cache", "build/kiln-cache.json"])
		.assert()
		.success();

	assert!(tmp.path().join("out/shapes.gen.h").is_file());
	assert!(tmp.path().join("build/kiln-cache.json").is_file());
	assert!(!tmp.path().join("generated").exists());

	Ok(())
}

#[test]
fn explicit_config_and_template_roots() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	write_file(
		tmp.path(),
		"configs/gen.toml",
		"[[steps]]\nname = \"reflect\"\ninput = \"schema/*.json\"\ntemplates = [\"reflect.gen.h.j2\"]\n",
	)?;
	write_file(tmp.path(), "schema/shapes.json", "{}")?;
	write_file(tmp.path(), "alt/reflect.gen.h.j2", "alt {{ name }}")?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.arg("--config")
		.arg(tmp.path().join("configs/gen.toml"))
		.args(["-t", "alt"])
		.assert()
		.success();

	let content = std::fs::read_to_string(tmp.path().join("generated/shapes.gen.h"))?;
	assert_eq!(content, "alt shapes");

	Ok(())
}

#[test]
fn data_arguments_use_attribute_values() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	write_file(
		tmp.path(),
		"kiln.toml",
		"[[steps]]\nname = \"count\"\ninput = \"schema/*.json\"\ntemplates = [\"count.txt.j2\"]\n",
	)?;
	write_file(tmp.path(), "schema/shapes.json", "{}")?;
	write_file(
		tmp.path(),
		"count.txt.j2",
		"{{ data.n + 1 }} {{ data.build.profile }}",
	)?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.args(["-d", "n=3", "--data", "build.profile=release"])
		.assert()
		.success();

	let content = std::fs::read_to_string(tmp.path().join("generated/shapes.txt"))?;
	assert_eq!(content, "4 release");

	Ok(())
}

#[test]
fn missing_config_is_invalid_input() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.code(2)
		.stderr(contains("no kiln.toml"));

	Ok(())
}

#[test]
fn parse_failures_exit_with_parsing_code() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;
	write_file(tmp.path(), "schema/broken.json", "{ not json")?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.code(5)
		.stderr(contains("failed to parse"));

	assert!(tmp.path().join("generated/shapes.gen.h").is_file());

	Ok(())
}

#[test]
fn unknown_condition_types_exit_with_configuring_code() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;
	write_file(
		tmp.path(),
		"kiln.toml",
		&format!("{CONFIG}condition = {{ type = \"sometimes\" }}\n"),
	)?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.code(4)
		.stderr(contains("unknown condition type"));

	Ok(())
}

#[test]
fn missing_templates_exit_before_rendering() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;
	std::fs::remove_file(tmp.path().join("templates/reflect.gen.h.j2"))?;

	kiln_cmd().arg("--path").arg(tmp.path()).assert().code(4);
	assert!(!tmp.path().join("generated").exists());

	Ok(())
}

#[test]
fn document_flags_are_passed_through() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;
	write_file(
		tmp.path(),
		"schema/shapes.json",
		r#"{ "members": [{ "kind": "gizmo", "name": "odd" }] }"#,
	)?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.arg("--document:strict")
		.assert()
		.code(6);

	kiln_cmd().arg("--path").arg(tmp.path()).assert().success();

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.arg("--clang:style=llvm")
		.assert()
		.code(2)
		.stderr(contains("unknown collaborator"));

	Ok(())
}

#[test]
fn dump_writes_documents() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.arg("--dump")
		.assert()
		.success()
		.stdout(contains("generated/shapes.kiln.json"));

	let dump: serde_json::Value =
		serde_json::from_str(&std::fs::read_to_string(tmp.path().join("generated/shapes.kiln.json"))?)?;
	assert_eq!(dump["name"], serde_json::json!("shapes"));
	assert_eq!(dump["members"][0]["kind"], serde_json::json!("record"));

	Ok(())
}

#[rstest]
#[case::sequential(&["--sequential"])]
#[case::worker_pool(&["--jobs", "2"])]
#[case::thread_per_input(&["--jobs", "0"])]
#[case::run_subcommand(&["run", "--jobs", "1"])]
fn execution_flags_produce_the_same_output(#[case] flags: &[&str]) -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;
	write_file(tmp.path(), "schema/nested/extra.json", "{}")?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.args(flags)
		.assert()
		.success()
		.stdout(contains("reflect: 2 rendered"));

	let nested = std::fs::read_to_string(tmp.path().join("generated/nested/extra.gen.h"))?;
	assert_eq!(nested, "// extra\n");

	Ok(())
}

#[cfg(unix)]
#[test]
fn format_command_rewrites_outputs() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.args(["--format-command", "tr a-z A-Z"])
		.assert()
		.success();

	let content = std::fs::read_to_string(tmp.path().join("generated/shapes.gen.h"))?;
	assert_eq!(content, "// SHAPES\nSTRUCT CIRCLESHAPE;\n");

	Ok(())
}

#[cfg(unix)]
#[test]
fn failing_formatters_keep_unformatted_output() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	shapes_project(tmp.path())?;
	write_file(
		tmp.path(),
		"kiln.toml",
		&format!("{CONFIG}\n[format]\ncommand = \"exit 1\"\n"),
	)?;

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.assert()
		.success()
		.stderr(contains("formatting failed"));

	let content = std::fs::read_to_string(tmp.path().join("generated/shapes.gen.h"))?;
	assert_eq!(content, "// shapes\nstruct CircleShape;\n");

	kiln_cmd()
		.arg("--path")
		.arg(tmp.path())
		.args(["--force", "--no-format"])
		.assert()
		.success()
		.stderr(contains("formatting failed").not());

	Ok(())
}
