use std::collections::BTreeSet;
use std::fmt::Display;

use derive_more::Deref;
use serde::Deserialize;
use serde::Serialize;

/// Attribute values keyed by name. Values are booleans, numbers, strings,
/// arrays or nested maps.
pub type AttributeMap = serde_json::Map<String, serde_json::Value>;

/// Opaque structural description of one input, produced by a
/// [`Parser`](crate::Parser) and consumed by a
/// [`Converter`](crate::Converter).
#[derive(Debug, Clone, PartialEq, Deref, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AstValue(serde_json::Value);

impl AstValue {
	pub fn new(value: serde_json::Value) -> Self {
		Self(value)
	}

	pub fn into_inner(self) -> serde_json::Value {
		self.0
	}
}

impl From<serde_json::Value> for AstValue {
	fn from(value: serde_json::Value) -> Self {
		Self(value)
	}
}

/// The kind of structural entity a [`Node`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NodeKind {
	#[default]
	File,
	Namespace,
	Record,
	Enum,
	Function,
	Field,
	Enumerator,
	Constructor,
	Other,
}

impl NodeKind {
	/// Resolve a kind name. Common spellings used by extractors (`class`,
	/// `struct`, `method`, `variable`, ...) map onto the closest kind.
	pub fn from_name(name: &str) -> Option<Self> {
		let kind = match name.trim().to_ascii_lowercase().as_str() {
			"file" | "module" | "unit" => Self::File,
			"namespace" | "package" => Self::Namespace,
			"record" | "class" | "struct" | "union" | "interface" => Self::Record,
			"enum" => Self::Enum,
			"function" | "method" | "fn" => Self::Function,
			"field" | "property" | "variable" | "member" => Self::Field,
			"enumerator" | "variant" | "enum_value" => Self::Enumerator,
			"constructor" | "ctor" => Self::Constructor,
			"other" => Self::Other,
			_ => return None,
		};

		Some(kind)
	}
}

impl Display for NodeKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			Self::File => "file",
			Self::Namespace => "namespace",
			Self::Record => "record",
			Self::Enum => "enum",
			Self::Function => "function",
			Self::Field => "field",
			Self::Enumerator => "enumerator",
			Self::Constructor => "constructor",
			Self::Other => "other",
		};
		f.write_str(name)
	}
}

/// An attributed structural entity: a file, type, function, field, etc.
///
/// Every kind shares the same shape; behaviour that would otherwise live in
/// per-kind types is driven by `kind` and the attribute map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
	pub kind: NodeKind,
	pub name: String,
	#[serde(default)]
	pub attributes: AttributeMap,
	#[serde(default)]
	pub flags: BTreeSet<String>,
	#[serde(default)]
	pub template_params: Vec<String>,
	#[serde(default)]
	pub members: Vec<Node>,
}

impl Node {
	pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
		Self {
			kind,
			name: name.into(),
			..Self::default()
		}
	}

	#[must_use]
	pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
		self.attributes.insert(key.into(), value);
		self
	}

	#[must_use]
	pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
		self.flags.insert(flag.into());
		self
	}

	#[must_use]
	pub fn with_member(mut self, member: Node) -> Self {
		self.members.push(member);
		self
	}

	pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
		self.attributes.get(key)
	}

	pub fn has_flag(&self, flag: &str) -> bool {
		self.flags.contains(flag)
	}

	/// The node itself followed by every directly owned member.
	pub fn reachable(&self) -> impl Iterator<Item = &Node> {
		std::iter::once(self).chain(self.members.iter())
	}
}
