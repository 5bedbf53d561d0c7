use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use minijinja::Value;

use crate::AstValue;
use crate::Collaborators;
use crate::DocumentConverter;
use crate::DocumentParser;
use crate::Formatter;
use crate::FunctionBackend;
use crate::KilnError;
use crate::KilnResult;
use crate::Parser;
use crate::RunOptions;
use crate::Step;

pub fn write_file(root: &Path, relative: &str, content: &str) -> PathBuf {
	let path = root.join(relative);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).unwrap_or_else(|e| panic!("create_dir_all: {e}"));
	}
	std::fs::write(&path, content).unwrap_or_else(|e| panic!("write: {e}"));
	path
}

pub fn read_file(path: &Path) -> String {
	std::fs::read_to_string(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

pub fn step(name: &str, input: &str, templates: &[&str]) -> Step {
	Step {
		name: name.to_string(),
		input: input.to_string(),
		templates: templates.iter().map(PathBuf::from).collect(),
		scripts: Vec::new(),
		condition: None,
	}
}

/// Options writing to `<root>/out` with `<root>/templates` as template root.
pub fn run_options(root: &Path) -> RunOptions {
	let mut options = RunOptions::new(root);
	options.output = root.join("out");
	options.template_roots = vec![PathBuf::from("templates")];
	options
}

pub fn document_collaborators() -> Collaborators {
	Collaborators::new(
		Arc::new(DocumentParser::default()),
		Arc::new(DocumentConverter::default()),
	)
}

/// Document parser that records how many paths it was asked to parse.
#[derive(Debug, Default)]
pub struct CountingParser {
	inner: DocumentParser,
	calls: AtomicUsize,
}

impl CountingParser {
	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

impl Parser for CountingParser {
	fn parse(&self, paths: &[PathBuf]) -> KilnResult<Vec<AstValue>> {
		self.calls.fetch_add(paths.len(), Ordering::SeqCst);
		self.inner.parse(paths)
	}
}

/// Formatter that passes text through unchanged and counts every rendered
/// output it sees.
#[derive(Debug, Default)]
pub struct CountingFormatter {
	calls: AtomicUsize,
}

impl CountingFormatter {
	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

impl Formatter for CountingFormatter {
	fn name(&self) -> &str {
		"counting"
	}

	fn extensions(&self) -> &[String] {
		&[]
	}

	fn format(&self, _path: &Path, text: &str) -> KilnResult<String> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		Ok(text.to_string())
	}
}

/// Backend returning a fixed string for each of its names.
#[derive(Debug)]
pub struct StaticBackend {
	pub name: &'static str,
	pub functions: BTreeMap<&'static str, &'static str>,
}

impl StaticBackend {
	pub fn new(name: &'static str, functions: &[(&'static str, &'static str)]) -> Self {
		Self {
			name,
			functions: functions.iter().copied().collect(),
		}
	}
}

impl FunctionBackend for StaticBackend {
	fn name(&self) -> &str {
		self.name
	}

	fn can_invoke(&self, name: &str) -> bool {
		self.functions.contains_key(name)
	}

	fn invoke(&self, name: &str, _params: &[Value]) -> KilnResult<Value> {
		self.functions
			.get(name)
			.map(|result| Value::from(*result))
			.ok_or_else(|| KilnError::UnknownFunction(name.to_string()))
	}

	fn for_each(&self, visit: &mut dyn FnMut(&str)) {
		for name in self.functions.keys() {
			visit(name);
		}
	}
}
