use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use minijinja::Environment;
use minijinja::Value;
use minijinja::context;
use minijinja::value::ValueKind;
use serde::Deserialize;
use serde::Serialize;

use crate::KilnError;
use crate::KilnResult;
use crate::cache::normalize_path_key;
use crate::render::bind_registry;

/// A source of callable functions for templates.
///
/// Each backend owns its own table of functions. The composite
/// [`ScriptRegistry`] only reads from backends, it never mutates them.
pub trait FunctionBackend: Send + Sync + fmt::Debug {
	/// Short name used in diagnostics, e.g. `native`.
	fn name(&self) -> &str;

	fn can_invoke(&self, name: &str) -> bool;

	fn invoke(&self, name: &str, params: &[Value]) -> KilnResult<Value>;

	/// Visit every function name this backend provides.
	fn for_each(&self, visit: &mut dyn FnMut(&str));
}

/// Which backend a position in `[functions] order` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
	/// The built-in [`NativeFunctions`](crate::NativeFunctions) catalog.
	Native,
	/// Macros defined in the step's scripts.
	Scripts,
}

pub const DEFAULT_BACKEND_ORDER: [BackendKind; 2] = [BackendKind::Native, BackendKind::Scripts];

/// Composite dispatcher over an ordered list of backends. A name is served by
/// the first backend that claims it.
#[derive(Debug, Clone, Default)]
pub struct ScriptRegistry {
	backends: Vec<Arc<dyn FunctionBackend>>,
}

impl ScriptRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_backend(mut self, backend: Arc<dyn FunctionBackend>) -> Self {
		self.backends.push(backend);
		self
	}

	pub fn push(&mut self, backend: Arc<dyn FunctionBackend>) {
		self.backends.push(backend);
	}

	pub fn backends(&self) -> &[Arc<dyn FunctionBackend>] {
		&self.backends
	}

	pub fn backend_for(&self, name: &str) -> Option<&Arc<dyn FunctionBackend>> {
		self.backends
			.iter()
			.find(|backend| backend.can_invoke(name))
	}

	pub fn can_invoke(&self, name: &str) -> bool {
		self.backend_for(name).is_some()
	}

	pub fn invoke(&self, name: &str, params: &[Value]) -> KilnResult<Value> {
		let Some(backend) = self.backend_for(name) else {
			return Err(KilnError::UnknownFunction(name.to_string()));
		};

		backend.invoke(name, params).map_err(|error| {
			match error {
				KilnError::FunctionFailed { .. } => error,
				other => {
					KilnError::FunctionFailed {
						name: name.to_string(),
						reason: other.to_string(),
					}
				}
			}
		})
	}

	/// Visit every bindable name once, in backend order.
	pub fn for_each(&self, visit: &mut dyn FnMut(&str)) {
		let mut seen = BTreeSet::new();
		for backend in &self.backends {
			backend.for_each(&mut |name| {
				if seen.insert(name.to_string()) {
					visit(name);
				}
			});
		}
	}

	/// Every bindable name paired with the backend that serves it.
	pub fn describe(&self) -> Vec<(String, String)> {
		let mut names = Vec::new();
		self.for_each(&mut |name| names.push(name.to_string()));

		names
			.into_iter()
			.map(|name| {
				let backend = self
					.backend_for(&name)
					.map(|backend| backend.name().to_string())
					.unwrap_or_default();
				(name, backend)
			})
			.collect()
	}
}

/// Functions defined as top-level `{% macro %}` blocks in script files.
///
/// ```jinja
/// {% macro guard(name) %}{{ name | upper }}_H{% endmacro %}
/// ```
///
/// Scripts are compiled once. Calling a function renders the macro and
/// returns its output as a string.
#[derive(Debug)]
pub struct MacroScripts {
	env: Environment<'static>,
	/// Function name → name of the script template defining it.
	functions: BTreeMap<String, String>,
}

impl MacroScripts {
	/// Compile `scripts` in order. When two scripts define the same macro the
	/// first definition wins. `helpers` are made callable from inside the
	/// macros.
	pub fn compile(scripts: &[PathBuf], helpers: Option<Arc<ScriptRegistry>>) -> KilnResult<Self> {
		let mut env = Environment::new();
		env.set_keep_trailing_newline(true);
		if let Some(helpers) = helpers {
			bind_registry(&mut env, &helpers);
		}

		let mut compiled = Vec::with_capacity(scripts.len());
		for path in scripts {
			let source =
				std::fs::read_to_string(path).map_err(|e| KilnError::file_io(path, e))?;
			let name = normalize_path_key(path);
			env.add_template_owned(name.clone(), source)
				.map_err(|e| compile_error(path, &e))?;
			compiled.push((path, name));
		}

		let mut functions = BTreeMap::new();
		for (path, name) in &compiled {
			let template = env.get_template(name).map_err(|e| compile_error(path, &e))?;
			let captured = template
				.render_captured(context! {})
				.map_err(|e| compile_error(path, &e))?;
			let state = captured.state();

			for export in state.exports() {
				if state.lookup(export).is_some_and(|value| is_macro(&value)) {
					functions
						.entry(export.to_string())
						.or_insert_with(|| name.clone());
				}
			}
		}

		tracing::debug!(
			scripts = scripts.len(),
			functions = functions.len(),
			"compiled step scripts"
		);

		Ok(Self { env, functions })
	}

	pub fn is_empty(&self) -> bool {
		self.functions.is_empty()
	}
}

impl FunctionBackend for MacroScripts {
	fn name(&self) -> &str {
		"scripts"
	}

	fn can_invoke(&self, name: &str) -> bool {
		self.functions.contains_key(name)
	}

	fn invoke(&self, name: &str, params: &[Value]) -> KilnResult<Value> {
		let Some(script) = self.functions.get(name) else {
			return Err(KilnError::UnknownFunction(name.to_string()));
		};

		let failed = |e: minijinja::Error| {
			KilnError::FunctionFailed {
				name: name.to_string(),
				reason: e.to_string(),
			}
		};

		// Macros are bound to the state that defined them, so the script is
		// evaluated again for every call.
		let template = self.env.get_template(script).map_err(failed)?;
		let captured = template.render_captured(context! {}).map_err(failed)?;
		let output = captured.state().call_macro(name, params).map_err(failed)?;

		Ok(Value::from(output))
	}

	fn for_each(&self, visit: &mut dyn FnMut(&str)) {
		for name in self.functions.keys() {
			visit(name);
		}
	}
}

/// Macros are map-like objects exposing their parameter names as
/// `arguments`.
fn is_macro(value: &Value) -> bool {
	value.kind() == ValueKind::Map
		&& value
			.get_attr("arguments")
			.is_ok_and(|arguments| arguments.kind() == ValueKind::Seq)
}

fn compile_error(path: &std::path::Path, error: &minijinja::Error) -> KilnError {
	KilnError::ScriptCompile {
		path: path.to_path_buf(),
		reason: error.to_string(),
	}
}
