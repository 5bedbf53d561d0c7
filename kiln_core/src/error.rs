use std::path::Path;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Broad classification of a [`KilnError`]. Each kind maps to one process
/// exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	InvalidInput,
	Io,
	Configuring,
	Parsing,
	Conversion,
	Rendering,
	Unknown,
}

impl ErrorKind {
	pub fn exit_code(self) -> i32 {
		match self {
			Self::Unknown => 1,
			Self::InvalidInput => 2,
			Self::Io => 3,
			Self::Configuring => 4,
			Self::Parsing => 5,
			Self::Conversion => 6,
			Self::Rendering => 7,
		}
	}
}

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum KilnError {
	#[error(transparent)]
	#[diagnostic(code(kiln::io_error))]
	Io(#[from] std::io::Error),

	#[error("failed to access `{path}`: {source}")]
	#[diagnostic(code(kiln::file_io))]
	FileIo {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("invalid input: {0}")]
	#[diagnostic(code(kiln::invalid_input))]
	InvalidInput(String),

	#[error("invalid input glob `{pattern}`: {reason}")]
	#[diagnostic(
		code(kiln::invalid_glob),
		help("input globs are resolved relative to the project root, e.g. `schema/**/*.json`")
	)]
	InvalidGlob { pattern: String, reason: String },

	#[error("failed to parse config file: {0}")]
	#[diagnostic(
		code(kiln::config_parse),
		help("check that kiln.toml is valid TOML with one or more [[steps]] tables")
	)]
	ConfigParse(String),

	#[error("template `{path}` for step `{step}` could not be found")]
	#[diagnostic(
		code(kiln::missing_template),
		help("template paths are searched literally and then in every `--template-root`")
	)]
	MissingTemplate { step: String, path: PathBuf },

	#[error("script `{path}` for step `{step}` could not be found")]
	#[diagnostic(code(kiln::missing_script))]
	MissingScript { step: String, path: PathBuf },

	#[error("unknown condition type: `{0}`")]
	#[diagnostic(
		code(kiln::unknown_condition),
		help("available condition types: all, any, none, attributes")
	)]
	UnknownCondition(String),

	#[error("failed to load data file `{path}`: {reason}")]
	#[diagnostic(code(kiln::data_file))]
	DataFile { path: String, reason: String },

	#[error("unsupported data file format: `{0}`")]
	#[diagnostic(
		code(kiln::unsupported_format),
		help("supported formats: text, json, toml, yaml, yml")
	)]
	UnsupportedDataFormat(String),

	#[error("invalid attribute list `{input}`: {reason}")]
	#[diagnostic(code(kiln::attribute_syntax))]
	AttributeSyntax { input: String, reason: String },

	#[error("failed to parse `{path}`: {reason}")]
	#[diagnostic(code(kiln::parse))]
	Parse { path: PathBuf, reason: String },

	#[error("failed to convert `{path}`: {reason}")]
	#[diagnostic(code(kiln::conversion))]
	Conversion { path: PathBuf, reason: String },

	#[error("failed to compile script `{path}`: {reason}")]
	#[diagnostic(code(kiln::script_compile))]
	ScriptCompile { path: PathBuf, reason: String },

	#[error("no function backend provides `{0}`")]
	#[diagnostic(
		code(kiln::unknown_function),
		help("run `kiln functions` to list every callable function")
	)]
	UnknownFunction(String),

	#[error("function `{name}` failed: {reason}")]
	#[diagnostic(code(kiln::function_failed))]
	FunctionFailed { name: String, reason: String },

	#[error("included template `{path}` could not be found")]
	#[diagnostic(
		code(kiln::missing_include),
		help("include paths are searched literally and then in every `--template-root`")
	)]
	MissingInclude { path: String },

	#[error("failed to render `{path}`: {reason}")]
	#[diagnostic(code(kiln::template_render))]
	TemplateRender { path: PathBuf, reason: String },

	#[error("failed to format `{path}`: {reason}")]
	#[diagnostic(code(kiln::format))]
	Format { path: PathBuf, reason: String },

	#[error("{0}")]
	#[diagnostic(code(kiln::unknown))]
	Unknown(String),
}

impl KilnError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Io(_) | Self::FileIo { .. } => ErrorKind::Io,
			Self::InvalidInput(_) | Self::InvalidGlob { .. } => ErrorKind::InvalidInput,
			Self::ConfigParse(_)
			| Self::MissingTemplate { .. }
			| Self::MissingScript { .. }
			| Self::UnknownCondition(_)
			| Self::DataFile { .. }
			| Self::UnsupportedDataFormat(_)
			| Self::ScriptCompile { .. } => ErrorKind::Configuring,
			Self::AttributeSyntax { .. } | Self::Parse { .. } => ErrorKind::Parsing,
			Self::Conversion { .. } => ErrorKind::Conversion,
			Self::UnknownFunction(_)
			| Self::FunctionFailed { .. }
			| Self::MissingInclude { .. }
			| Self::TemplateRender { .. }
			| Self::Format { .. } => ErrorKind::Rendering,
			Self::Unknown(_) => ErrorKind::Unknown,
		}
	}

	pub(crate) fn file_io(path: &Path, source: std::io::Error) -> Self {
		Self::FileIo {
			path: path.to_path_buf(),
			source,
		}
	}
}

pub type KilnResult<T> = Result<T, KilnError>;
pub type AnyError = Box<dyn std::error::Error>;
pub type AnyEmptyResult = Result<(), AnyError>;
pub type AnyResult<T> = Result<T, AnyError>;
