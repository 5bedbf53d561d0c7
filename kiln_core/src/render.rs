use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use minijinja::AutoEscape;
use minijinja::Environment;
use minijinja::Error;
use minijinja::ErrorKind;
use minijinja::State;
use minijinja::UndefinedBehavior;
use minijinja::Value;
use minijinja::value::Rest;

use crate::KilnError;
use crate::KilnResult;
use crate::ScriptRegistry;
use crate::cache::normalize_path_key;

/// Resolves template paths: the literal path (relative to `base`) first, then
/// each template root in order.
#[derive(Debug, Clone, Default)]
pub struct TemplateSearch {
	base: PathBuf,
	roots: Vec<PathBuf>,
}

impl TemplateSearch {
	pub fn new(base: impl Into<PathBuf>, roots: Vec<PathBuf>) -> Self {
		Self {
			base: base.into(),
			roots,
		}
	}

	pub fn roots(&self) -> &[PathBuf] {
		&self.roots
	}

	/// The first existing file matching `path`, or `None`.
	pub fn resolve(&self, path: &Path) -> Option<PathBuf> {
		let literal = self.base.join(path);
		if literal.is_file() {
			return Some(literal);
		}

		self.roots
			.iter()
			.map(|root| self.base.join(root).join(path))
			.find(|candidate| candidate.is_file())
	}
}

/// Renders templates for one step. Cheap to share between threads, each call
/// to [`Renderer::render`] gets its own [`RenderContext`].
#[derive(Debug, Clone)]
pub struct Renderer {
	search: TemplateSearch,
	registry: Arc<ScriptRegistry>,
}

impl Renderer {
	pub fn new(search: TemplateSearch, registry: Arc<ScriptRegistry>) -> Self {
		Self { search, registry }
	}

	pub fn search(&self) -> &TemplateSearch {
		&self.search
	}

	pub fn registry(&self) -> &Arc<ScriptRegistry> {
		&self.registry
	}

	/// Render the template at `template` with `document` as the root value.
	pub fn render(&self, template: &Path, document: &serde_json::Value) -> KilnResult<String> {
		let context = RenderContext::new(self);
		context.render(template, Value::from_serialize(document))
	}
}

/// The root slot shared between a context and the functions bound into its
/// environment.
#[derive(Debug)]
struct RenderScope {
	current_root: Mutex<Value>,
	search: TemplateSearch,
}

impl RenderScope {
	fn lock(&self) -> MutexGuard<'_, Value> {
		self.current_root
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	fn current(&self) -> Value {
		self.lock().clone()
	}

	/// Swap in a new root until the returned guard is dropped.
	fn enter(&self, root: Value) -> RootGuard<'_> {
		let previous = std::mem::replace(&mut *self.lock(), root);
		RootGuard {
			scope: self,
			previous: Some(previous),
		}
	}

	fn include(&self, state: &State, path: &str, extra: &[Value]) -> Result<Value, Error> {
		let root = match extra.len() {
			0 => self.current(),
			1 => extra[0].clone(),
			n if n % 2 == 0 => {
				let pairs: Vec<Value> = extra
					.chunks(2)
					.map(|pair| {
						let key = pair[0]
							.as_str()
							.map_or_else(|| pair[0].to_string(), ToString::to_string);
						Value::from(BTreeMap::from([(key, pair[1].clone())]))
					})
					.collect();
				Value::from(pairs)
			}
			n => {
				return Err(Error::new(
					ErrorKind::InvalidOperation,
					format!(
						"include(`{path}`) takes one root value or key/value pairs, got {n} extra \
						 arguments"
					),
				));
			}
		};

		let Some(resolved) = self.search.resolve(Path::new(path)) else {
			return Err(Error::new(
				ErrorKind::TemplateNotFound,
				format!("included template `{path}` could not be found"),
			)
			.with_source(KilnError::MissingInclude {
				path: path.to_string(),
			}));
		};

		let template = state.env().get_template(&normalize_path_key(&resolved))?;
		let _guard = self.enter(root.clone());
		let rendered = template.render(root)?;

		Ok(Value::from_safe_string(rendered))
	}
}

struct RootGuard<'a> {
	scope: &'a RenderScope,
	previous: Option<Value>,
}

impl Drop for RootGuard<'_> {
	fn drop(&mut self) {
		if let Some(previous) = self.previous.take() {
			*self.scope.lock() = previous;
		}
	}
}

/// One render: a fresh environment with the step's functions, `include` and
/// `root` bound, plus the current root slot.
pub struct RenderContext {
	env: Environment<'static>,
	scope: Arc<RenderScope>,
}

impl RenderContext {
	pub fn new(renderer: &Renderer) -> Self {
		let scope = Arc::new(RenderScope {
			current_root: Mutex::new(Value::UNDEFINED),
			search: renderer.search.clone(),
		});

		let mut env = Environment::new();
		env.set_keep_trailing_newline(true);
		env.set_undefined_behavior(UndefinedBehavior::Chainable);
		env.set_auto_escape_callback(|_| AutoEscape::None);
		env.set_loader(load_template);
		bind_registry(&mut env, &renderer.registry);

		let include_scope = Arc::clone(&scope);
		env.add_function(
			"include",
			move |state: &State, path: String, extra: Rest<Value>| {
				include_scope.include(state, &path, &extra.0)
			},
		);

		let root_scope = Arc::clone(&scope);
		env.add_function("root", move || -> Result<Value, Error> { Ok(root_scope.current()) });

		Self { env, scope }
	}

	/// The value templates currently resolve variables against.
	pub fn root(&self) -> Value {
		self.scope.current()
	}

	pub fn render(&self, template: &Path, root: Value) -> KilnResult<String> {
		let _guard = self.scope.enter(root.clone());
		let name = normalize_path_key(template);

		let compiled = self
			.env
			.get_template(&name)
			.map_err(|e| render_error(template, &e))?;
		compiled.render(root).map_err(|e| render_error(template, &e))
	}
}

/// Bind every name the registry enumerates as a global function.
pub(crate) fn bind_registry(env: &mut Environment<'static>, registry: &Arc<ScriptRegistry>) {
	registry.for_each(&mut |name| {
		let registry = Arc::clone(registry);
		let function = name.to_string();
		env.add_function(
			name.to_string(),
			move |args: Rest<Value>| -> Result<Value, Error> {
				registry.invoke(&function, &args.0).map_err(|e| {
					Error::new(ErrorKind::InvalidOperation, e.to_string()).with_source(e)
				})
			},
		);
	});
}

fn load_template(name: &str) -> Result<Option<String>, Error> {
	match std::fs::read_to_string(name) {
		Ok(source) => Ok(Some(source)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => {
			Err(Error::new(
				ErrorKind::InvalidOperation,
				format!("failed to read template `{name}`"),
			)
			.with_source(e))
		}
	}
}

/// Recover a kiln error raised inside the engine (missing include, failing
/// function) so it surfaces with its own diagnostic. Everything else becomes
/// a render error for `template`.
fn render_error(template: &Path, error: &Error) -> KilnError {
	let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);

	while let Some(current) = source {
		if let Some(inner) = current.downcast_ref::<KilnError>() {
			match inner {
				KilnError::MissingInclude { path } => {
					return KilnError::MissingInclude { path: path.clone() };
				}
				KilnError::FunctionFailed { name, reason } => {
					return KilnError::FunctionFailed {
						name: name.clone(),
						reason: reason.clone(),
					};
				}
				KilnError::UnknownFunction(name) => {
					return KilnError::UnknownFunction(name.clone());
				}
				_ => {}
			}
		}
		source = current.source();
	}

	KilnError::TemplateRender {
		path: template.to_path_buf(),
		reason: error.to_string(),
	}
}
