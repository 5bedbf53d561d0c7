use std::ffi::OsString;

use kiln_cli::split_collaborator_flags;
use rstest::rstest;
use similar_asserts::assert_eq;

#[test]
fn collaborator_flags_are_separated() {
	let (remaining, flags) = split_collaborator_flags([
		"kiln",
		"--document:strict",
		"-o",
		"out",
		"--document:format=yaml",
		"--output=C:/generated",
		"--",
		"--document:ignored",
	]);

	let remaining: Vec<String> = remaining
		.iter()
		.map(|arg| arg.to_string_lossy().to_string())
		.collect();
	assert_eq!(
		remaining,
		vec!["kiln", "-o", "out", "--output=C:/generated", "--", "--document:ignored"]
	);
	assert_eq!(
		flags.get("document"),
		Some(&vec!["strict".to_string(), "format=yaml".to_string()])
	);
	assert_eq!(flags.len(), 1);
}

#[rstest]
#[case::empty_flag("--document:")]
#[case::empty_collaborator("--:strict")]
#[case::invalid_collaborator("--doc ument:strict")]
#[case::single_dash("-document:strict")]
#[case::value_with_colon("url=a:b")]
fn incomplete_flags_reach_clap(#[case] arg: &str) {
	let (remaining, flags) = split_collaborator_flags(["kiln", arg].map(OsString::from));

	assert!(flags.is_empty());
	assert_eq!(remaining, vec![OsString::from("kiln"), OsString::from(arg)]);
}
