use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::BackendKind;
use crate::CommandFormatter;
use crate::ConditionFactory;
use crate::DEFAULT_BACKEND_ORDER;
use crate::DEFAULT_CACHE_PATH;
use crate::FormatterSet;
use crate::JsonFormatter;
use crate::KilnError;
use crate::KilnResult;
use crate::Step;
use crate::condition::ConditionSpec;
use crate::merge_value;
use crate::parse_attribute_value;

/// Supported config file locations in discovery order (highest precedence
/// first).
pub const CONFIG_FILE_CANDIDATES: [&str; 3] = ["kiln.toml", ".kiln.toml", ".config/kiln.toml"];

/// Output directory used when neither the config nor the command line names
/// one.
pub const DEFAULT_OUTPUT_DIR: &str = "generated";

/// Reserved root key under which user data is exposed to templates.
pub const DATA_KEY: &str = "data";

/// Data source entry for a `[data]` namespace.
///
/// ```toml
/// [data]
/// project = "project.json"
/// release = { path = "release-info", format = "yaml" }
/// ```
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum DataSource {
	Path(PathBuf),
	Typed(TypedDataSource),
}

impl DataSource {
	pub fn path(&self) -> &Path {
		match self {
			Self::Path(path) => path,
			Self::Typed(typed) => &typed.path,
		}
	}

	/// The explicit format, falling back to the file extension.
	pub fn format(&self) -> String {
		match self {
			Self::Path(path) => {
				path.extension()
					.and_then(|extension| extension.to_str())
					.unwrap_or("")
					.to_ascii_lowercase()
			}
			Self::Typed(typed) => typed.format.to_ascii_lowercase(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct TypedDataSource {
	pub path: PathBuf,
	pub format: String,
}

/// Precedence of function backends.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FunctionsConfig {
	#[serde(default = "default_backend_order")]
	pub order: Vec<BackendKind>,
}

impl Default for FunctionsConfig {
	fn default() -> Self {
		Self {
			order: default_backend_order(),
		}
	}
}

fn default_backend_order() -> Vec<BackendKind> {
	DEFAULT_BACKEND_ORDER.to_vec()
}

/// Post-processing of generated files.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct FormatConfig {
	/// Shell command receiving the generated text on stdin.
	#[serde(default)]
	pub command: Option<String>,
	/// Extensions the command applies to. Empty means every output.
	#[serde(default)]
	pub extensions: Vec<String>,
	/// Re-pretty-print `.json` outputs.
	#[serde(default)]
	pub json: bool,
}

impl FormatConfig {
	pub fn formatters(&self, root: &Path) -> FormatterSet {
		let mut formatters = FormatterSet::new();

		if let Some(command) = self.command.as_deref().filter(|c| !c.trim().is_empty()) {
			formatters = formatters.with_formatter(Arc::new(CommandFormatter::new(
				command,
				self.extensions.clone(),
				root.to_path_buf(),
			)));
		}

		if self.json {
			formatters = formatters.with_formatter(Arc::new(JsonFormatter::default()));
		}

		formatters
	}
}

/// One `[[steps]]` table.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StepConfig {
	pub name: String,
	/// Glob of input files relative to the project root.
	pub input: String,
	pub templates: Vec<PathBuf>,
	#[serde(default)]
	pub scripts: Vec<PathBuf>,
	#[serde(default)]
	pub condition: Option<ConditionSpec>,
}

/// Configuration loaded from a `kiln.toml` file.
///
/// ```toml
/// output = "generated"
/// template_roots = ["templates"]
///
/// [data]
/// project = "project.json"
///
/// [[steps]]
/// name = "reflect"
/// input = "schema/**/*.json"
/// templates = ["reflect.gen.h.j2"]
/// condition = { type = "attributes", attributes = "reflect" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KilnConfig {
	#[serde(default)]
	pub output: Option<PathBuf>,
	#[serde(default)]
	pub cache: Option<PathBuf>,
	#[serde(default)]
	pub template_roots: Vec<PathBuf>,
	#[serde(default)]
	pub data: HashMap<String, DataSource>,
	#[serde(default)]
	pub functions: FunctionsConfig,
	#[serde(default)]
	pub format: FormatConfig,
	#[serde(default)]
	pub steps: Vec<StepConfig>,
	#[serde(default)]
	pub sequential: bool,
	/// Worker bound for parallel input processing. `0` means one thread per
	/// input.
	#[serde(default)]
	pub jobs: Option<usize>,
}

impl KilnConfig {
	/// Returns the first config path found under `root`.
	pub fn resolve_path(root: &Path) -> Option<PathBuf> {
		CONFIG_FILE_CANDIDATES
			.iter()
			.map(|candidate| root.join(candidate))
			.find(|path| path.is_file())
	}

	/// Load the config from the first discovered config file at `root`.
	/// Returns `None` if no file exists.
	pub fn load(root: &Path) -> KilnResult<Option<Self>> {
		let Some(config_path) = Self::resolve_path(root) else {
			return Ok(None);
		};

		Self::load_file(&config_path).map(Some)
	}

	pub fn load_file(path: &Path) -> KilnResult<Self> {
		let content = std::fs::read_to_string(path).map_err(|e| KilnError::file_io(path, e))?;
		Self::parse(&content)
	}

	pub fn parse(content: &str) -> KilnResult<Self> {
		toml::from_str(content).map_err(|e| KilnError::ConfigParse(e.to_string()))
	}

	/// Build the executable steps, resolving every condition through
	/// `factory`.
	pub fn steps(&self, factory: &ConditionFactory) -> KilnResult<Vec<Step>> {
		self.steps
			.iter()
			.map(|step| {
				if step.name.trim().is_empty() {
					return Err(KilnError::ConfigParse(
						"every step needs a non-empty `name`".to_string(),
					));
				}

				if step.templates.is_empty() {
					return Err(KilnError::ConfigParse(format!(
						"step `{}` declares no templates",
						step.name
					)));
				}

				let condition = match &step.condition {
					Some(spec) => {
						let Some(condition) = factory.create(spec)? else {
							let unknown = factory.find_unknown(spec).unwrap_or(spec.kind.as_str());
							return Err(KilnError::UnknownCondition(unknown.to_string()));
						};
						Some(condition)
					}
					None => None,
				};

				Ok(Step {
					name: step.name.clone(),
					input: step.input.clone(),
					templates: step.templates.clone(),
					scripts: step.scripts.clone(),
					condition,
				})
			})
			.collect()
	}

	/// Read each data file and parse it into a value keyed by namespace.
	pub fn load_data(&self, root: &Path) -> KilnResult<serde_json::Map<String, Value>> {
		let mut data = serde_json::Map::new();

		let mut namespaces: Vec<_> = self.data.iter().collect();
		namespaces.sort_by(|a, b| a.0.cmp(b.0));

		for (namespace, source) in namespaces {
			let path = root.join(source.path());
			let path_display = source.path().display().to_string();
			let content = std::fs::read_to_string(&path).map_err(|e| {
				KilnError::DataFile {
					path: path_display.clone(),
					reason: e.to_string(),
				}
			})?;

			let value = parse_data_file(&content, &source.format(), &path_display)?;
			data.insert(namespace.clone(), value);
		}

		Ok(data)
	}
}

/// Resolved settings for one pipeline run. Command line flags are applied on
/// top of [`RunOptions::from_config`].
#[derive(Debug, Clone)]
pub struct RunOptions {
	/// Project root. Inputs, templates and data are resolved against it.
	pub root: PathBuf,
	pub output: PathBuf,
	pub cache_path: PathBuf,
	pub template_roots: Vec<PathBuf>,
	/// User data exposed under the reserved `data` key.
	pub data: serde_json::Map<String, Value>,
	pub force: bool,
	pub parallel: bool,
	/// `0` spawns one thread per input.
	pub jobs: usize,
	/// Write the converted document next to each output.
	pub dump: bool,
	pub backend_order: Vec<BackendKind>,
}

impl RunOptions {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		let root = root.into();
		Self {
			output: root.join(DEFAULT_OUTPUT_DIR),
			cache_path: root.join(DEFAULT_CACHE_PATH),
			root,
			template_roots: Vec::new(),
			data: serde_json::Map::new(),
			force: false,
			parallel: true,
			jobs: 0,
			dump: false,
			backend_order: default_backend_order(),
		}
	}

	/// Resolve options from an optional config, loading every `[data]` file.
	pub fn from_config(root: &Path, config: Option<&KilnConfig>) -> KilnResult<Self> {
		let mut options = Self::new(root);
		let Some(config) = config else {
			return Ok(options);
		};

		if let Some(output) = &config.output {
			options.output = root.join(output);
		}

		if let Some(cache) = &config.cache {
			options.cache_path = root.join(cache);
		}

		options.template_roots.clone_from(&config.template_roots);
		options.parallel = !config.sequential;
		options.jobs = config.jobs.unwrap_or(0);
		if !config.functions.order.is_empty() {
			options.backend_order.clone_from(&config.functions.order);
		}
		options.data = config.load_data(root)?;

		Ok(options)
	}

	/// Apply a `key=value` argument. The value is resolved with the attribute
	/// value grammar and dotted keys create nested maps. A bare key is `true`.
	pub fn insert_data_arg(&mut self, argument: &str) -> KilnResult<()> {
		let (key, value) = match argument.split_once('=') {
			Some((key, value)) => (key.trim(), parse_attribute_value(value)),
			None => (argument.trim(), Value::Bool(true)),
		};

		if key.is_empty() || key.split('.').any(str::is_empty) {
			return Err(KilnError::InvalidInput(format!(
				"`--data {argument}` needs a key such as `name=value`"
			)));
		}

		let nested = key
			.rsplit('.')
			.fold(value, |inner, segment| {
				let mut map = serde_json::Map::new();
				map.insert(segment.to_string(), inner);
				Value::Object(map)
			});

		let mut current = Value::Object(std::mem::take(&mut self.data));
		merge_value(&mut current, nested);
		if let Value::Object(map) = current {
			self.data = map;
		}

		Ok(())
	}
}

/// Parse a data file's content into a value based on its format.
pub fn parse_data_file(content: &str, format: &str, path_display: &str) -> KilnResult<Value> {
	let failed = |reason: String| {
		KilnError::DataFile {
			path: path_display.to_string(),
			reason,
		}
	};

	match format {
		"text" | "string" | "raw" | "txt" => Ok(Value::String(content.to_string())),
		"json" => serde_json::from_str(content).map_err(|e| failed(e.to_string())),
		"toml" => {
			let value: toml::Value = toml::from_str(content).map_err(|e| failed(e.to_string()))?;
			toml_to_json(value).map_err(failed)
		}
		"yaml" | "yml" => serde_yaml_ng::from_str(content).map_err(|e| failed(e.to_string())),
		other => Err(KilnError::UnsupportedDataFormat(other.to_string())),
	}
}

/// Convert a `toml::Value` to JSON. Integers stay integers and datetimes
/// become strings.
pub(crate) fn toml_to_json(value: toml::Value) -> Result<Value, String> {
	let json = match value {
		toml::Value::String(s) => Value::String(s),
		toml::Value::Integer(i) => Value::Number(i.into()),
		toml::Value::Float(f) => {
			Value::Number(
				serde_json::Number::from_f64(f)
					.ok_or_else(|| format!("float `{f}` cannot be represented"))?,
			)
		}
		toml::Value::Boolean(b) => Value::Bool(b),
		toml::Value::Datetime(dt) => Value::String(dt.to_string()),
		toml::Value::Array(items) => {
			Value::Array(
				items
					.into_iter()
					.map(toml_to_json)
					.collect::<Result<_, _>>()?,
			)
		}
		toml::Value::Table(table) => {
			let mut map = serde_json::Map::new();
			for (key, value) in table {
				map.insert(key, toml_to_json(value)?);
			}
			Value::Object(map)
		}
	};

	Ok(json)
}
