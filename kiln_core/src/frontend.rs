//! Parser and converter contracts plus the built-in document frontend.
//!
//! The document frontend reads structural descriptions written as JSON, YAML
//! or TOML:
//!
//! ```json
//! {
//!   "name": "shapes",
//!   "attributes": "reflect",
//!   "members": [
//!     { "kind": "class", "name": "Circle", "attributes": { "tags": ["serialize"] } }
//!   ]
//! }
//! ```

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::AstValue;
use crate::AttributeMap;
use crate::KilnError;
use crate::KilnResult;
use crate::Node;
use crate::NodeKind;
use crate::config::toml_to_json;
use crate::merge_attributes;
use crate::parse_attributes;

/// Turns input files into opaque structural values.
pub trait Parser: Send + Sync {
	/// Parse every path. The result holds one value per path, in order.
	fn parse(&self, paths: &[PathBuf]) -> KilnResult<Vec<AstValue>>;
}

/// Turns a parsed value into a [`Node`] tree.
pub trait Converter: Send + Sync {
	fn convert(&self, ast: &AstValue) -> KilnResult<Node>;
}

/// Options passed through as `--document:<flag>` on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentOptions {
	/// Reject unknown `kind` values instead of mapping them to
	/// [`NodeKind::Other`].
	pub strict: bool,
	/// Read every input as this format regardless of extension.
	pub format: Option<String>,
}

impl DocumentOptions {
	/// Interpret passthrough flags such as `strict` or `format=yaml`.
	pub fn from_flags(flags: &[String]) -> KilnResult<Self> {
		let mut options = Self::default();

		for flag in flags {
			match flag.split_once('=') {
				None if flag == "strict" => options.strict = true,
				Some(("strict", value)) => {
					options.strict = value.parse().map_err(|_| {
						KilnError::InvalidInput(format!("`--document:strict` expects a boolean, got `{value}`"))
					})?;
				}
				Some(("format", value)) => options.format = Some(value.to_ascii_lowercase()),
				_ => {
					return Err(KilnError::InvalidInput(format!(
						"unknown document flag `--document:{flag}`"
					)));
				}
			}
		}

		Ok(options)
	}
}

/// Reads JSON, YAML or TOML documents, choosing the format from the file
/// extension.
#[derive(Debug, Clone, Default)]
pub struct DocumentParser {
	format: Option<String>,
}

impl DocumentParser {
	pub fn new(options: &DocumentOptions) -> Self {
		Self {
			format: options.format.clone(),
		}
	}

	fn parse_one(&self, path: &Path) -> KilnResult<AstValue> {
		let content = std::fs::read_to_string(path).map_err(|e| KilnError::file_io(path, e))?;
		let format = self.format.clone().unwrap_or_else(|| {
			path.extension()
				.and_then(|extension| extension.to_str())
				.unwrap_or("")
				.to_ascii_lowercase()
		});

		let failed = |reason: String| {
			KilnError::Parse {
				path: path.to_path_buf(),
				reason,
			}
		};

		let mut value: serde_json::Value = match format.as_str() {
			"json" => serde_json::from_str(&content).map_err(|e| failed(e.to_string()))?,
			"yaml" | "yml" => serde_yaml_ng::from_str(&content).map_err(|e| failed(e.to_string()))?,
			"toml" => {
				let value: toml::Value =
					toml::from_str(&content).map_err(|e| failed(e.to_string()))?;
				toml_to_json(value).map_err(failed)?
			}
			other => return Err(failed(format!("unsupported document format `{other}`"))),
		};

		let serde_json::Value::Object(root) = &mut value else {
			return Err(failed("the document root must be a table".to_string()));
		};

		if !root.contains_key("name") {
			let stem = path
				.file_stem()
				.map(|stem| stem.to_string_lossy().to_string())
				.unwrap_or_default();
			root.insert("name".to_string(), serde_json::Value::String(stem));
		}

		if !root.contains_key("kind") {
			root.insert(
				"kind".to_string(),
				serde_json::Value::String(NodeKind::File.to_string()),
			);
		}

		Ok(AstValue::new(value))
	}
}

impl Parser for DocumentParser {
	fn parse(&self, paths: &[PathBuf]) -> KilnResult<Vec<AstValue>> {
		paths.iter().map(|path| self.parse_one(path)).collect()
	}
}

#[derive(Debug, Deserialize)]
struct RawNode {
	#[serde(default)]
	kind: Option<String>,
	#[serde(default)]
	name: String,
	#[serde(default, alias = "annotations")]
	attributes: Option<RawAttributes>,
	#[serde(default)]
	flags: Vec<String>,
	#[serde(default, alias = "template_parameters")]
	template_params: Vec<String>,
	#[serde(default, alias = "children")]
	members: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAttributes {
	Table(AttributeMap),
	Annotation(String),
	List(Vec<RawAttributes>),
}

impl RawAttributes {
	fn resolve(self, into: &mut AttributeMap) -> KilnResult<()> {
		match self {
			Self::Table(map) => merge_attributes(into, map),
			Self::Annotation(source) => merge_attributes(into, parse_attributes(&source)?),
			Self::List(items) => {
				for item in items {
					item.resolve(into)?;
				}
			}
		}

		Ok(())
	}
}

/// Builds [`Node`] trees from documents read by [`DocumentParser`].
#[derive(Debug, Clone, Default)]
pub struct DocumentConverter {
	strict: bool,
}

impl DocumentConverter {
	pub fn new(options: &DocumentOptions) -> Self {
		Self {
			strict: options.strict,
		}
	}

	fn convert_raw(&self, raw: RawNode, top_level: bool) -> KilnResult<Node> {
		let kind = match raw.kind.as_deref() {
			None if top_level => NodeKind::File,
			None => NodeKind::Other,
			Some(name) => {
				match NodeKind::from_name(name) {
					Some(kind) => kind,
					None if self.strict => {
						return Err(conversion_error(format!(
							"unknown kind `{name}` on `{}`",
							raw.name
						)));
					}
					None => {
						tracing::debug!(kind = name, node = %raw.name, "unknown kind mapped to `other`");
						NodeKind::Other
					}
				}
			}
		};

		let mut attributes = AttributeMap::new();
		if let Some(raw_attributes) = raw.attributes {
			raw_attributes.resolve(&mut attributes).map_err(|e| {
				conversion_error(format!("invalid attributes on `{}`: {e}", raw.name))
			})?;
		}

		let members = raw
			.members
			.into_iter()
			.map(|member| self.convert_raw(member, false))
			.collect::<KilnResult<Vec<_>>>()?;

		Ok(Node {
			kind,
			name: raw.name,
			attributes,
			flags: raw.flags.into_iter().collect(),
			template_params: raw.template_params,
			members,
		})
	}
}

impl Converter for DocumentConverter {
	fn convert(&self, ast: &AstValue) -> KilnResult<Node> {
		let raw: RawNode = serde_json::from_value(ast.clone().into_inner())
			.map_err(|e| conversion_error(e.to_string()))?;
		self.convert_raw(raw, true)
	}
}

/// The pipeline fills in the input path.
fn conversion_error(reason: String) -> KilnError {
	KilnError::Conversion {
		path: PathBuf::new(),
		reason,
	}
}
