use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::AttributeMap;
use crate::KilnResult;
use crate::Node;
use crate::parse_attributes;

/// Boolean predicate over a node's attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
	/// Every child matches. Empty is `true`.
	All(Vec<Condition>),
	/// At least one child matches. Empty is `false`.
	Any(Vec<Condition>),
	/// No child matches. Empty is `true`.
	None(Vec<Condition>),
	/// Every key finds at least one reachable entity whose attribute satisfies
	/// the expected value.
	AttributeFilter(AttributeMap),
}

impl Condition {
	pub fn matches(&self, node: &Node) -> bool {
		match self {
			Self::All(children) => children.iter().all(|child| child.matches(node)),
			Self::Any(children) => children.iter().any(|child| child.matches(node)),
			Self::None(children) => !children.iter().any(|child| child.matches(node)),
			Self::AttributeFilter(filter) => {
				filter.iter().all(|(key, expected)| {
					node.reachable().any(|entity| {
						entity
							.attribute(key)
							.is_some_and(|found| attribute_satisfies(found, expected))
					})
				})
			}
		}
	}
}

/// An array found for a non-array expectation is a membership test. Two arrays
/// match when equal or when every expected element is present. Everything else
/// requires identical type and value.
fn attribute_satisfies(found: &Value, expected: &Value) -> bool {
	match (found, expected) {
		(Value::Array(items), Value::Array(wanted)) => {
			items == wanted || wanted.iter().all(|item| items.contains(item))
		}
		(Value::Array(items), scalar) => items.contains(scalar),
		_ => found == expected,
	}
}

/// Filter attributes as written in configuration: either a table or an
/// attribute-pair string such as `"reflect, category=io"`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AttributeSpec {
	Table(AttributeMap),
	Annotation(String),
}

impl AttributeSpec {
	pub fn resolve(&self) -> KilnResult<AttributeMap> {
		match self {
			Self::Table(map) => Ok(map.clone()),
			Self::Annotation(source) => parse_attributes(source),
		}
	}
}

/// A condition as declared in `kiln.toml`.
///
/// ```toml
/// condition = { type = "any", children = [
///   { type = "attributes", attributes = "reflect" },
///   { type = "attributes", attributes = { tags = "serialize" } },
/// ] }
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ConditionSpec {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub children: Vec<ConditionSpec>,
	#[serde(default)]
	pub attributes: Option<AttributeSpec>,
}

pub type ConditionConstructor =
	fn(&ConditionSpec, &ConditionFactory) -> KilnResult<Option<Condition>>;

/// Maps a declared condition `type` to its constructor.
///
/// Constructed once and passed by reference to whatever loads configuration.
pub struct ConditionFactory {
	constructors: BTreeMap<String, ConditionConstructor>,
}

impl fmt::Debug for ConditionFactory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConditionFactory")
			.field("types", &self.constructors.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl Default for ConditionFactory {
	fn default() -> Self {
		let mut factory = Self::empty();
		factory.register("all", build_all);
		factory.register("any", build_any);
		factory.register("none", build_none);
		factory.register("attributes", build_filter);
		factory.register("attribute", build_filter);
		factory.register("filter", build_filter);
		factory
	}
}

impl ConditionFactory {
	pub fn new() -> Self {
		Self::default()
	}

	/// A factory with no registered types.
	pub fn empty() -> Self {
		Self {
			constructors: BTreeMap::new(),
		}
	}

	pub fn register(&mut self, kind: impl Into<String>, constructor: ConditionConstructor) {
		self.constructors
			.insert(kind.into().to_ascii_lowercase(), constructor);
	}

	pub fn types(&self) -> impl Iterator<Item = &str> {
		self.constructors.keys().map(String::as_str)
	}

	/// Build a condition tree. `Ok(None)` means the spec (or one of its
	/// descendants) names a type this factory does not know.
	pub fn create(&self, spec: &ConditionSpec) -> KilnResult<Option<Condition>> {
		let Some(constructor) = self.constructors.get(&spec.kind.to_ascii_lowercase()) else {
			return Ok(None);
		};

		constructor(spec, self)
	}

	/// The first unknown type found anywhere in the spec tree.
	pub fn find_unknown<'a>(&self, spec: &'a ConditionSpec) -> Option<&'a str> {
		if !self
			.constructors
			.contains_key(&spec.kind.to_ascii_lowercase())
		{
			return Some(spec.kind.as_str());
		}

		spec.children
			.iter()
			.find_map(|child| self.find_unknown(child))
	}

	fn create_children(&self, spec: &ConditionSpec) -> KilnResult<Option<Vec<Condition>>> {
		let mut children = Vec::with_capacity(spec.children.len());
		for child in &spec.children {
			let Some(condition) = self.create(child)? else {
				return Ok(None);
			};
			children.push(condition);
		}
		Ok(Some(children))
	}
}

fn build_all(spec: &ConditionSpec, factory: &ConditionFactory) -> KilnResult<Option<Condition>> {
	Ok(factory.create_children(spec)?.map(Condition::All))
}

fn build_any(spec: &ConditionSpec, factory: &ConditionFactory) -> KilnResult<Option<Condition>> {
	Ok(factory.create_children(spec)?.map(Condition::Any))
}

fn build_none(spec: &ConditionSpec, factory: &ConditionFactory) -> KilnResult<Option<Condition>> {
	Ok(factory.create_children(spec)?.map(Condition::None))
}

fn build_filter(spec: &ConditionSpec, _: &ConditionFactory) -> KilnResult<Option<Condition>> {
	let attributes = match &spec.attributes {
		Some(attributes) => attributes.resolve()?,
		None => AttributeMap::new(),
	};

	Ok(Some(Condition::AttributeFilter(attributes)))
}
