use std::fmt;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;

use crate::KilnError;
use crate::KilnResult;

/// Environment variable holding the path of the file being formatted.
pub const FORMAT_PATH_ENV: &str = "KILN_FORMAT_PATH";

/// Reformats generated text before or after it is written.
pub trait Formatter: Send + Sync + fmt::Debug {
	fn name(&self) -> &str;

	/// File extensions (without the dot) this formatter claims. An empty list
	/// claims every file.
	fn extensions(&self) -> &[String];

	fn format(&self, path: &Path, text: &str) -> KilnResult<String>;

	fn can_format(&self, path: &Path) -> bool {
		let extensions = self.extensions();
		if extensions.is_empty() {
			return true;
		}

		path.extension()
			.and_then(|extension| extension.to_str())
			.is_some_and(|extension| {
				extensions
					.iter()
					.any(|claimed| claimed.trim_start_matches('.').eq_ignore_ascii_case(extension))
			})
	}
}

/// Ordered formatters. The first one claiming a path formats it.
#[derive(Debug, Clone, Default)]
pub struct FormatterSet {
	formatters: Vec<Arc<dyn Formatter>>,
}

impl FormatterSet {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
		self.formatters.push(formatter);
		self
	}

	pub fn is_empty(&self) -> bool {
		self.formatters.is_empty()
	}

	pub fn can_format(&self, path: &Path) -> bool {
		self.formatters
			.iter()
			.any(|formatter| formatter.can_format(path))
	}

	/// Format `text` for `path`. Failures are logged and the original text is
	/// returned unchanged.
	pub fn format(&self, path: &Path, text: String) -> String {
		let Some(formatter) = self
			.formatters
			.iter()
			.find(|formatter| formatter.can_format(path))
		else {
			return text;
		};

		match formatter.format(path, &text) {
			Ok(formatted) => formatted,
			Err(e) => {
				tracing::warn!(
					path = %path.display(),
					formatter = formatter.name(),
					"formatting failed, keeping unformatted output: {e}"
				);
				text
			}
		}
	}
}

/// Pipes text through a shell command (`clang-format`, `rustfmt --emit
/// stdout`, ...) and reads the formatted result from stdout.
#[derive(Debug, Clone)]
pub struct CommandFormatter {
	command: String,
	extensions: Vec<String>,
	working_dir: PathBuf,
}

impl CommandFormatter {
	pub fn new(command: impl Into<String>, extensions: Vec<String>, working_dir: PathBuf) -> Self {
		Self {
			command: command.into(),
			extensions,
			working_dir,
		}
	}

	pub fn command(&self) -> &str {
		&self.command
	}
}

impl Formatter for CommandFormatter {
	fn name(&self) -> &str {
		&self.command
	}

	fn extensions(&self) -> &[String] {
		&self.extensions
	}

	fn format(&self, path: &Path, text: &str) -> KilnResult<String> {
		let failed = |reason: String| {
			KilnError::Format {
				path: path.to_path_buf(),
				reason,
			}
		};

		let mut command = if cfg!(windows) {
			let mut command = Command::new("cmd");
			command.arg("/C").arg(&self.command);
			command
		} else {
			let mut command = Command::new("sh");
			command.arg("-c").arg(&self.command);
			command
		};

		let mut child = command
			.current_dir(&self.working_dir)
			.env(FORMAT_PATH_ENV, path)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()
			.map_err(|e| failed(format!("failed to start `{}`: {e}", self.command)))?;

		let Some(mut stdin) = child.stdin.take() else {
			return Err(failed("formatter stdin unavailable".to_string()));
		};

		// Feed stdin from a separate thread so a formatter that fills its
		// stdout pipe before draining stdin cannot deadlock.
		let output = std::thread::scope(|scope| {
			let writer = scope.spawn(move || stdin.write_all(text.as_bytes()));
			let output = child.wait_with_output();
			let written = writer
				.join()
				.unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
			(output, written)
		});

		let (output, written) = output;
		let output = output.map_err(|e| failed(e.to_string()))?;

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
			let reason = if stderr.is_empty() {
				format!(
					"command exited with status {}",
					output
						.status
						.code()
						.map_or_else(|| "unknown".to_string(), |code| code.to_string())
				)
			} else {
				stderr
			};
			return Err(failed(reason));
		}

		written.map_err(|e| failed(format!("failed to write to formatter: {e}")))?;

		String::from_utf8(output.stdout).map_err(|e| failed(e.to_string()))
	}
}

/// Re-pretty-prints JSON output with two space indentation.
#[derive(Debug, Clone)]
pub struct JsonFormatter {
	extensions: Vec<String>,
}

impl Default for JsonFormatter {
	fn default() -> Self {
		Self {
			extensions: vec!["json".to_string()],
		}
	}
}

impl Formatter for JsonFormatter {
	fn name(&self) -> &str {
		"json"
	}

	fn extensions(&self) -> &[String] {
		&self.extensions
	}

	fn format(&self, path: &Path, text: &str) -> KilnResult<String> {
		let failed = |e: serde_json::Error| {
			KilnError::Format {
				path: path.to_path_buf(),
				reason: e.to_string(),
			}
		};

		let value: serde_json::Value = serde_json::from_str(text).map_err(failed)?;
		let mut formatted = serde_json::to_string_pretty(&value).map_err(failed)?;
		formatted.push('\n');
		Ok(formatted)
	}
}
