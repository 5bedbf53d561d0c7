use std::collections::BTreeMap;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use heck::ToKebabCase;
use heck::ToLowerCamelCase;
use heck::ToShoutySnakeCase;
use heck::ToSnakeCase;
use heck::ToUpperCamelCase;
use minijinja::Value;
use minijinja::value::ValueKind;
use serde::Serialize;

use crate::FunctionBackend;
use crate::KilnError;
use crate::KilnResult;
use crate::parse_attributes;

pub type NativeFn = fn(&[Value]) -> KilnResult<Value>;

/// Upper bound in bytes on text built by repeating a string.
pub const MAX_REPEATED_LEN: usize = 1 << 20;

/// Widest indentation `to_json` accepts.
pub const MAX_JSON_INDENT: usize = 64;

/// The built-in catalog of pure helper functions available to every template
/// and script.
#[derive(Debug, Clone)]
pub struct NativeFunctions {
	functions: BTreeMap<&'static str, NativeFn>,
}

impl Default for NativeFunctions {
	fn default() -> Self {
		let catalog: [(&'static str, NativeFn); 31] = [
			("starts_with", starts_with),
			("ends_with", ends_with),
			("contains", contains),
			("is_blank", is_blank),
			("upper", upper),
			("lower", lower),
			("trim", trim),
			("replace", replace),
			("snake_case", snake_case),
			("camel_case", camel_case),
			("pascal_case", pascal_case),
			("kebab_case", kebab_case),
			("screaming_snake_case", screaming_snake_case),
			("split", split),
			("join", join),
			("path_stem", path_stem),
			("path_extension", path_extension),
			("path_file_name", path_file_name),
			("path_parent", path_parent),
			("path_join", path_join),
			("path_components", path_components),
			("to_json", to_json),
			("to_yaml", to_yaml),
			("to_toml", to_toml),
			("embed_bytes", embed_bytes),
			("flatten", flatten),
			("parse_attributes", parse_attribute_list),
			("is_empty", is_empty),
			("default", default_value),
			("repeat", repeat),
			("indent", indent),
		];

		Self {
			functions: catalog.into_iter().collect(),
		}
	}
}

impl NativeFunctions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
		self.functions.keys().copied()
	}
}

impl FunctionBackend for NativeFunctions {
	fn name(&self) -> &str {
		"native"
	}

	fn can_invoke(&self, name: &str) -> bool {
		self.functions.contains_key(name)
	}

	fn invoke(&self, name: &str, params: &[Value]) -> KilnResult<Value> {
		let Some(function) = self.functions.get(name) else {
			return Err(KilnError::UnknownFunction(name.to_string()));
		};

		function(params)
	}

	fn for_each(&self, visit: &mut dyn FnMut(&str)) {
		for name in self.functions.keys() {
			visit(name);
		}
	}
}

fn is_missing(value: &Value) -> bool {
	value.is_undefined() || value.is_none()
}

/// String form of an argument. Missing arguments read as the empty string.
fn text(args: &[Value], index: usize) -> String {
	match args.get(index) {
		Some(value) if is_missing(value) => String::new(),
		Some(value) => value.as_str().map_or_else(|| value.to_string(), ToString::to_string),
		None => String::new(),
	}
}

fn optional_text(args: &[Value], index: usize) -> Option<String> {
	args.get(index)
		.filter(|value| !is_missing(value))
		.map(|_| text(args, index))
}

fn count(args: &[Value], index: usize) -> Option<usize> {
	args.get(index)
		.filter(|value| !is_missing(value))
		.and_then(|value| i64::try_from(value.clone()).ok())
		.and_then(|number| usize::try_from(number).ok())
}

fn items(value: &Value) -> Vec<Value> {
	match value.kind() {
		ValueKind::Seq | ValueKind::Iterable => {
			value
				.try_iter()
				.map(Iterator::collect)
				.unwrap_or_default()
		}
		_ if is_missing(value) => Vec::new(),
		_ => vec![value.clone()],
	}
}

fn to_document(value: &Value) -> serde_json::Value {
	serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn failed(name: &str, reason: impl ToString) -> KilnError {
	KilnError::FunctionFailed {
		name: name.to_string(),
		reason: reason.to_string(),
	}
}

/// `unit` repeated `times` times, failing instead of allocating more than
/// `MAX_REPEATED_LEN` bytes. `copies` is how often the result is used.
fn repeated(name: &str, unit: &str, times: usize, copies: usize) -> KilnResult<String> {
	let total = unit
		.len()
		.checked_mul(times)
		.and_then(|len| len.checked_mul(copies.max(1)));

	match total {
		Some(len) if len <= MAX_REPEATED_LEN => Ok(unit.repeat(times)),
		_ => {
			Err(failed(
				name,
				format!("the result would exceed {MAX_REPEATED_LEN} bytes"),
			))
		}
	}
}

fn starts_with(args: &[Value]) -> KilnResult<Value> {
	Ok(Value::from(text(args, 0).starts_with(&text(args, 1))))
}

fn ends_with(args: &[Value]) -> KilnResult<Value> {
	Ok(Value::from(text(args, 0).ends_with(&text(args, 1))))
}

/// Substring test for strings, membership test for sequences.
fn contains(args: &[Value]) -> KilnResult<Value> {
	let haystack = args.first().cloned().unwrap_or_default();
	let needle = args.get(1).cloned().unwrap_or_default();

	if matches!(haystack.kind(), ValueKind::Seq | ValueKind::Iterable) {
		return Ok(Value::from(items(&haystack).contains(&needle)));
	}

	Ok(Value::from(text(args, 0).contains(&text(args, 1))))
}

fn is_blank(args: &[Value]) -> KilnResult<Value> {
	Ok(Value::from(text(args, 0).trim().is_empty()))
}

fn is_empty(args: &[Value]) -> KilnResult<Value> {
	let value = args.first().cloned().unwrap_or_default();
	let empty = match value.kind() {
		ValueKind::Undefined | ValueKind::None => true,
		ValueKind::Seq | ValueKind::Map | ValueKind::Iterable => value.len() == Some(0),
		_ => text(args, 0).is_empty(),
	};

	Ok(Value::from(empty))
}

fn default_value(args: &[Value]) -> KilnResult<Value> {
	match args.first() {
		Some(value) if !is_missing(value) => Ok(value.clone()),
		_ => Ok(args.get(1).cloned().unwrap_or_else(|| Value::from(""))),
	}
}

fn upper(args: &[Value]) -> KilnResult<Value> {
	Ok(Value::from(text(args, 0).to_uppercase()))
}

fn lower(args: &[Value]) -> KilnResult<Value> {
	Ok(Value::from(text(args, 0).to_lowercase()))
}

fn trim(args: &[Value]) -> KilnResult<Value> {
	let source = text(args, 0);
	let trimmed = match optional_text(args, 1) {
		Some(chars) => source.trim_matches(|ch| chars.contains(ch)).to_string(),
		None => source.trim().to_string(),
	};

	Ok(Value::from(trimmed))
}

fn replace(args: &[Value]) -> KilnResult<Value> {
	let source = text(args, 0);
	let from = text(args, 1);
	let to = text(args, 2);

	if from.is_empty() {
		return Ok(Value::from(source));
	}

	let replaced = match count(args, 3) {
		Some(limit) => source.replacen(&from, &to, limit),
		None => source.replace(&from, &to),
	};

	Ok(Value::from(replaced))
}

fn snake_case(args: &[Value]) -> KilnResult<Value> {
	Ok(Value::from(text(args, 0).to_snake_case()))
}

fn camel_case(args: &[Value]) -> KilnResult<Value> {
	Ok(Value::from(text(args, 0).to_lower_camel_case()))
}

fn pascal_case(args: &[Value]) -> KilnResult<Value> {
	Ok(Value::from(text(args, 0).to_upper_camel_case()))
}

fn kebab_case(args: &[Value]) -> KilnResult<Value> {
	Ok(Value::from(text(args, 0).to_kebab_case()))
}

fn screaming_snake_case(args: &[Value]) -> KilnResult<Value> {
	Ok(Value::from(text(args, 0).to_shouty_snake_case()))
}

fn split(args: &[Value]) -> KilnResult<Value> {
	let source = text(args, 0);
	let separator = optional_text(args, 1).unwrap_or_else(|| ",".to_string());

	if source.is_empty() {
		return Ok(Value::from(Vec::<Value>::new()));
	}

	let parts: Vec<Value> = if separator.is_empty() {
		source.chars().map(|ch| Value::from(ch.to_string())).collect()
	} else {
		source
			.split(separator.as_str())
			.map(|part| Value::from(part.trim()))
			.collect()
	};

	Ok(Value::from(parts))
}

fn join(args: &[Value]) -> KilnResult<Value> {
	let list = args.first().cloned().unwrap_or_default();
	let separator = text(args, 1);
	let joined = items(&list)
		.iter()
		.map(|item| item.as_str().map_or_else(|| item.to_string(), ToString::to_string))
		.collect::<Vec<_>>()
		.join(&separator);

	Ok(Value::from(joined))
}

fn repeat(args: &[Value]) -> KilnResult<Value> {
	let times = count(args, 1).unwrap_or(1);
	repeated("repeat", &text(args, 0), times, 1).map(Value::from)
}

/// Prefix every non-empty line after the first with `width` spaces.
fn indent(args: &[Value]) -> KilnResult<Value> {
	let source = text(args, 0);
	let width = count(args, 1).unwrap_or(4);
	let padding = repeated("indent", " ", width, source.matches('\n').count())?;
	let mut lines = source.split('\n');
	let mut result = lines.next().unwrap_or_default().to_string();

	for line in lines {
		result.push('\n');
		if !line.is_empty() {
			result.push_str(&padding);
		}
		result.push_str(line);
	}

	Ok(Value::from(result))
}

fn path_text(path: Option<&Path>) -> Value {
	Value::from(path.map(|path| path.to_string_lossy().replace('\\', "/")).unwrap_or_default())
}

fn path_stem(args: &[Value]) -> KilnResult<Value> {
	let path = PathBuf::from(text(args, 0));
	Ok(path_text(path.file_stem().map(Path::new)))
}

fn path_extension(args: &[Value]) -> KilnResult<Value> {
	let path = PathBuf::from(text(args, 0));
	Ok(path_text(path.extension().map(Path::new)))
}

fn path_file_name(args: &[Value]) -> KilnResult<Value> {
	let path = PathBuf::from(text(args, 0));
	Ok(path_text(path.file_name().map(Path::new)))
}

fn path_parent(args: &[Value]) -> KilnResult<Value> {
	let path = PathBuf::from(text(args, 0));
	Ok(path_text(path.parent()))
}

/// Join every argument (lists are flattened) into a single path.
fn path_join(args: &[Value]) -> KilnResult<Value> {
	let mut path = PathBuf::new();
	for arg in args {
		for part in items(arg) {
			let part = part.as_str().map_or_else(|| part.to_string(), ToString::to_string);
			if !part.is_empty() {
				path.push(part);
			}
		}
	}

	Ok(path_text(Some(&path)))
}

fn path_components(args: &[Value]) -> KilnResult<Value> {
	let path = PathBuf::from(text(args, 0));
	let components: Vec<Value> = path
		.components()
		.filter_map(|component| {
			match component {
				Component::Normal(part) => Some(Value::from(part.to_string_lossy().to_string())),
				Component::RootDir => Some(Value::from("/")),
				Component::Prefix(prefix) => {
					Some(Value::from(prefix.as_os_str().to_string_lossy().to_string()))
				}
				Component::CurDir | Component::ParentDir => None,
			}
		})
		.collect();

	Ok(Value::from(components))
}

fn to_json(args: &[Value]) -> KilnResult<Value> {
	let document = to_document(&args.first().cloned().unwrap_or_default());
	let indent = count(args, 1).unwrap_or(2);

	if indent == 0 {
		return serde_json::to_string(&document)
			.map(Value::from)
			.map_err(|e| failed("to_json", e));
	}

	if indent > MAX_JSON_INDENT {
		return Err(failed(
			"to_json",
			format!("indent {indent} is wider than {MAX_JSON_INDENT}"),
		));
	}

	let padding = " ".repeat(indent);
	let formatter = serde_json::ser::PrettyFormatter::with_indent(padding.as_bytes());
	let mut buffer = Vec::new();
	let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
	document
		.serialize(&mut serializer)
		.map_err(|e| failed("to_json", e))?;

	Ok(Value::from(String::from_utf8_lossy(&buffer).to_string()))
}

fn to_yaml(args: &[Value]) -> KilnResult<Value> {
	let document = to_document(&args.first().cloned().unwrap_or_default());
	serde_yaml_ng::to_string(&document)
		.map(Value::from)
		.map_err(|e| failed("to_yaml", e))
}

/// TOML has no null and needs a table at the top level. Nulls are dropped and
/// anything other than a map is wrapped under `value`.
fn to_toml(args: &[Value]) -> KilnResult<Value> {
	let document = strip_nulls(to_document(&args.first().cloned().unwrap_or_default()));
	let table = match document {
		serde_json::Value::Object(map) => serde_json::Value::Object(map),
		serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
		other => serde_json::json!({ "value": other }),
	};

	let value = toml::Value::try_from(table).map_err(|e| failed("to_toml", e))?;
	toml::to_string_pretty(&value)
		.map(Value::from)
		.map_err(|e| failed("to_toml", e))
}

fn strip_nulls(value: serde_json::Value) -> serde_json::Value {
	match value {
		serde_json::Value::Object(map) => {
			serde_json::Value::Object(
				map.into_iter()
					.filter(|(_, value)| !value.is_null())
					.map(|(key, value)| (key, strip_nulls(value)))
					.collect(),
			)
		}
		serde_json::Value::Array(items) => {
			serde_json::Value::Array(
				items
					.into_iter()
					.filter(|value| !value.is_null())
					.map(strip_nulls)
					.collect(),
			)
		}
		other => other,
	}
}

/// Render bytes as comma separated hex literals, `per_line` to a line.
///
/// Accepts a string, raw bytes or a list of integers.
fn embed_bytes(args: &[Value]) -> KilnResult<Value> {
	let data = args.first().cloned().unwrap_or_default();
	let per_line = count(args, 1).filter(|n| *n > 0).unwrap_or(16);
	let prefix = optional_text(args, 2).unwrap_or_else(|| "0x".to_string());

	let bytes: Vec<u8> = match data.kind() {
		ValueKind::Seq | ValueKind::Iterable => {
			items(&data)
				.into_iter()
				.map(|item| {
					i64::try_from(item.clone())
						.ok()
						.and_then(|number| u8::try_from(number).ok())
						.ok_or_else(|| failed("embed_bytes", format!("`{item}` is not a byte")))
				})
				.collect::<KilnResult<_>>()?
		}
		_ => {
			data.as_bytes()
				.map(<[u8]>::to_vec)
				.unwrap_or_else(|| text(args, 0).into_bytes())
		}
	};

	let lines: Vec<String> = bytes
		.chunks(per_line)
		.map(|chunk| {
			chunk
				.iter()
				.map(|byte| format!("{prefix}{byte:02x}"))
				.collect::<Vec<_>>()
				.join(", ")
		})
		.collect();

	Ok(Value::from(lines.join(",\n")))
}

/// Collapse a nested document into a single-level map keyed by dotted paths.
/// Array elements are addressed by index.
fn flatten(args: &[Value]) -> KilnResult<Value> {
	let document = to_document(&args.first().cloned().unwrap_or_default());
	let separator = optional_text(args, 1).unwrap_or_else(|| ".".to_string());
	let mut flat = BTreeMap::new();
	flatten_into(&mut flat, String::new(), document, &separator);

	Ok(Value::from_serialize(&flat))
}

fn flatten_into(
	flat: &mut BTreeMap<String, serde_json::Value>,
	prefix: String,
	value: serde_json::Value,
	separator: &str,
) {
	let join = |key: &str| {
		if prefix.is_empty() {
			key.to_string()
		} else {
			format!("{prefix}{separator}{key}")
		}
	};

	match value {
		serde_json::Value::Object(map) if !map.is_empty() => {
			for (key, value) in map {
				flatten_into(flat, join(&key), value, separator);
			}
		}
		serde_json::Value::Array(items) if !items.is_empty() => {
			for (index, value) in items.into_iter().enumerate() {
				flatten_into(flat, join(&index.to_string()), value, separator);
			}
		}
		other => {
			flat.insert(prefix, other);
		}
	}
}

fn parse_attribute_list(args: &[Value]) -> KilnResult<Value> {
	let attributes = parse_attributes(&text(args, 0))?;
	Ok(Value::from_serialize(&attributes))
}
