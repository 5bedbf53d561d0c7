//! Attribute-pair grammar.
//!
//! ```text
//! list   := entry ("," entry)*
//! entry  := key | key "=" value
//! value  := quoted | "(" list ")" | bare
//! ```
//!
//! A bare key becomes `true`, a parenthesized value becomes a nested map and
//! bare values are resolved as literals (integers, floats, booleans, `null`)
//! before falling back to strings. Repeated keys are merged with
//! [`merge_value`].

use std::ops::Range;

use logos::Logos;
use serde_json::Number;
use serde_json::Value;

use crate::AttributeMap;
use crate::KilnError;
use crate::KilnResult;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
enum AttributeToken {
	#[token("(")]
	OpenParen,
	#[token(")")]
	CloseParen,
	#[token(",")]
	Comma,
	#[token("=")]
	Equals,
	#[regex(r#""([^"\\]|\\(.|\n))*""#)]
	DoubleQuoted,
	#[regex(r"'([^'\\]|\\(.|\n))*'")]
	SingleQuoted,
	#[regex(r#"[^,=()"'\s][^,=()\s]*"#)]
	Bare,
}

impl AttributeToken {
	fn is_quoted(self) -> bool {
		matches!(self, Self::DoubleQuoted | Self::SingleQuoted)
	}

	fn ends_value(self) -> bool {
		matches!(self, Self::Comma | Self::CloseParen)
	}
}

/// Parse an attribute list such as `reflect, category=(name="io", id=3)`.
///
/// Empty or whitespace-only input yields an empty map.
pub fn parse_attributes(input: &str) -> KilnResult<AttributeMap> {
	let mut parser = AttributeParser::new(input)?;
	parser.parse_entries(false)
}

/// Resolve a bare token the way attribute values are resolved: integers,
/// floats, `true`, `false` and `null` become literals, everything else is kept
/// as a trimmed string.
pub fn parse_attribute_value(token: &str) -> Value {
	let token = token.trim();

	match token {
		"true" => return Value::Bool(true),
		"false" => return Value::Bool(false),
		"null" => return Value::Null,
		_ => {}
	}

	if let Ok(int) = token.parse::<i64>() {
		return Value::Number(int.into());
	}

	if let Ok(uint) = token.parse::<u64>() {
		return Value::Number(uint.into());
	}

	if looks_numeric(token) {
		if let Some(number) = token.parse::<f64>().ok().and_then(Number::from_f64) {
			return Value::Number(number);
		}
	}

	Value::String(token.to_string())
}

/// Merge `incoming` into `into` key by key using [`merge_value`].
pub fn merge_attributes(into: &mut AttributeMap, incoming: AttributeMap) {
	for (key, value) in incoming {
		merge_entry(into, key, value);
	}
}

/// Merge one value into another: arrays concatenate, objects deep-merge and
/// anything else is replaced by `incoming`.
pub fn merge_value(existing: &mut Value, incoming: Value) {
	match (existing, incoming) {
		(Value::Array(current), Value::Array(mut extra)) => current.append(&mut extra),
		(Value::Object(current), Value::Object(extra)) => merge_attributes(current, extra),
		(slot, incoming) => *slot = incoming,
	}
}

fn merge_entry(map: &mut AttributeMap, key: String, value: Value) {
	match map.get_mut(&key) {
		Some(existing) => merge_value(existing, value),
		None => {
			map.insert(key, value);
		}
	}
}

fn looks_numeric(token: &str) -> bool {
	token.bytes().any(|byte| byte.is_ascii_digit())
		&& token
			.bytes()
			.all(|byte| byte.is_ascii_digit() || matches!(byte, b'.' | b'-' | b'+' | b'e' | b'E'))
}

/// Strip one level of backslash escaping. `\n`, `\t`, `\r` and `\0` map to
/// their control characters, any other escaped character is kept verbatim.
fn unescape(inner: &str) -> String {
	let mut result = String::with_capacity(inner.len());
	let mut chars = inner.chars();

	while let Some(ch) = chars.next() {
		if ch != '\\' {
			result.push(ch);
			continue;
		}

		match chars.next() {
			Some('n') => result.push('\n'),
			Some('t') => result.push('\t'),
			Some('r') => result.push('\r'),
			Some('0') => result.push('\0'),
			Some(other) => result.push(other),
			None => result.push('\\'),
		}
	}

	result
}

struct AttributeParser<'a> {
	source: &'a str,
	tokens: Vec<(AttributeToken, Range<usize>)>,
	cursor: usize,
}

impl<'a> AttributeParser<'a> {
	fn new(source: &'a str) -> KilnResult<Self> {
		let mut tokens = Vec::new();

		for (result, span) in AttributeToken::lexer(source).spanned() {
			let Ok(token) = result else {
				let reason = if source[span.start..].starts_with(['"', '\'']) {
					format!("unterminated string starting at offset {}", span.start)
				} else {
					format!("unexpected character at offset {}", span.start)
				};
				return Err(syntax_error(source, reason));
			};
			tokens.push((token, span));
		}

		Ok(Self {
			source,
			tokens,
			cursor: 0,
		})
	}

	fn peek(&self) -> Option<AttributeToken> {
		self.tokens.get(self.cursor).map(|(token, _)| *token)
	}

	fn span(&self, index: usize) -> Range<usize> {
		self.tokens[index].1.clone()
	}

	fn error(&self, reason: impl Into<String>) -> KilnError {
		syntax_error(self.source, reason.into())
	}

	fn parse_entries(&mut self, nested: bool) -> KilnResult<AttributeMap> {
		let mut map = AttributeMap::new();

		loop {
			let Some(token) = self.peek() else {
				if nested {
					return Err(self.error("unclosed `(`"));
				}
				return Ok(map);
			};

			match token {
				AttributeToken::CloseParen => {
					if nested {
						self.cursor += 1;
						return Ok(map);
					}
					let offset = self.span(self.cursor).start;
					return Err(self.error(format!("unmatched `)` at offset {offset}")));
				}
				AttributeToken::Comma => self.cursor += 1,
				_ => {
					let (key, value) = self.parse_entry()?;
					merge_entry(&mut map, key, value);
				}
			}
		}
	}

	fn parse_entry(&mut self) -> KilnResult<(String, Value)> {
		let key = self.parse_key()?;

		if self.peek() == Some(AttributeToken::Equals) {
			self.cursor += 1;
			let value = self.parse_value()?;
			return Ok((key, value));
		}

		match self.peek() {
			None | Some(AttributeToken::Comma | AttributeToken::CloseParen) => {
				Ok((key, Value::Bool(true)))
			}
			Some(_) => {
				let offset = self.span(self.cursor).start;
				Err(self.error(format!(
					"expected `,` or `=` after key `{key}` at offset {offset}"
				)))
			}
		}
	}

	fn parse_key(&mut self) -> KilnResult<String> {
		let start = self.cursor;

		match self.peek() {
			Some(token) if token.is_quoted() => {
				self.cursor += 1;
				Ok(self.quoted_contents(start))
			}
			Some(AttributeToken::Bare) => {
				while self.peek() == Some(AttributeToken::Bare) {
					self.cursor += 1;
				}
				Ok(self.slice(start, self.cursor).to_string())
			}
			Some(AttributeToken::Equals) => {
				let offset = self.span(start).start;
				Err(self.error(format!("missing key before `=` at offset {offset}")))
			}
			_ => {
				let offset = self.span(start).start;
				Err(self.error(format!("unexpected `(` at offset {offset}")))
			}
		}
	}

	fn parse_value(&mut self) -> KilnResult<Value> {
		let start = self.cursor;

		match self.peek() {
			None | Some(AttributeToken::Comma | AttributeToken::CloseParen) => {
				Ok(Value::String(String::new()))
			}
			Some(AttributeToken::OpenParen) => {
				self.cursor += 1;
				let nested = self.parse_entries(true)?;
				match self.peek() {
					None | Some(AttributeToken::Comma | AttributeToken::CloseParen) => {
						Ok(Value::Object(nested))
					}
					Some(_) => {
						let offset = self.span(self.cursor).start;
						Err(self.error(format!("unexpected content after `)` at offset {offset}")))
					}
				}
			}
			Some(token) if token.is_quoted() && self.is_value_end(start + 1) => {
				self.cursor += 1;
				Ok(Value::String(self.quoted_contents(start)))
			}
			Some(_) => self.parse_bare_value(),
		}
	}

	/// Consume tokens up to the next top-level `,` or `)` and resolve the
	/// covered source text as a literal. Parentheses inside a bare value must
	/// balance.
	fn parse_bare_value(&mut self) -> KilnResult<Value> {
		let start = self.cursor;
		let mut depth = 0usize;

		while let Some(token) = self.peek() {
			match token {
				AttributeToken::Comma if depth == 0 => break,
				AttributeToken::CloseParen if depth == 0 => break,
				AttributeToken::CloseParen => depth -= 1,
				AttributeToken::OpenParen => depth += 1,
				_ => {}
			}
			self.cursor += 1;
		}

		if depth > 0 {
			return Err(self.error("unclosed `(`"));
		}

		Ok(parse_attribute_value(self.slice(start, self.cursor)))
	}

	fn is_value_end(&self, index: usize) -> bool {
		self.tokens
			.get(index)
			.is_none_or(|(token, _)| token.ends_value())
	}

	fn slice(&self, start: usize, end: usize) -> &'a str {
		let from = self.tokens[start].1.start;
		let to = self.tokens[end - 1].1.end;
		self.source[from..to].trim()
	}

	fn quoted_contents(&self, index: usize) -> String {
		let span = self.span(index);
		unescape(&self.source[span.start + 1..span.end - 1])
	}
}

fn syntax_error(source: &str, reason: String) -> KilnError {
	KilnError::AttributeSyntax {
		input: source.to_string(),
		reason,
	}
}
