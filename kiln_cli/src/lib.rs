use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;

#[derive(Parser)]
#[command(
	author,
	version,
	about = "Incremental, template-driven code generation from structural metadata.",
	long_about = "kiln parses input files into attributed structural trees, filters them with \
	              declarative conditions and renders them through minijinja templates.\n\nOnly \
	              inputs whose content (or whose templates) changed since the previous run are \
	              regenerated.\n\nQuick start:\n  kiln            Run every step in kiln.toml\n  \
	              kiln functions  List the functions templates can call\n  kiln cache      \
	              Inspect the content cache",
	after_help = "Collaborator flags are passed through as `--<collaborator>:<flag>`, e.g. \
	              `--document:strict` or `--document:format=yaml`."
)]
#[allow(clippy::struct_excessive_bools)]
pub struct KilnCli {
	#[command(subcommand)]
	pub command: Option<Commands>,

	/// Path to the project root directory.
	#[arg(long, short, global = true)]
	pub path: Option<PathBuf>,

	/// Config file to use instead of the discovered `kiln.toml`.
	#[arg(long, short, global = true)]
	pub config: Option<PathBuf>,

	/// Directory generated files are written to.
	#[arg(long, short, global = true)]
	pub output: Option<PathBuf>,

	/// Location of the content cache file.
	#[arg(long, global = true)]
	pub cache: Option<PathBuf>,

	/// Additional directory searched for templates, scripts and includes.
	/// Searched before the roots from the config file.
	#[arg(long = "template-root", short = 't', global = true)]
	pub template_roots: Vec<PathBuf>,

	/// User data exposed to templates as `data.<key>`. Values use the attribute
	/// grammar, so `-d jobs=3` is a number and `-d build.profile=release`
	/// nests.
	#[arg(long, short, global = true, value_name = "KEY=VALUE")]
	pub data: Vec<String>,

	/// Regenerate every input even when nothing changed.
	#[arg(long, short, global = true, default_value_t = false)]
	pub force: bool,

	/// Process inputs one at a time.
	#[arg(long, global = true, default_value_t = false)]
	pub sequential: bool,

	/// Upper bound on worker threads per step. `0` spawns one thread per
	/// input.
	#[arg(long, global = true)]
	pub jobs: Option<usize>,

	/// Shell command generated text is piped through before it is written.
	#[arg(long, global = true, conflicts_with = "no_format")]
	pub format_command: Option<String>,

	/// Skip every configured formatter.
	#[arg(long, global = true, default_value_t = false)]
	pub no_format: bool,

	/// Write each converted document as `<stem>.kiln.json` next to its
	/// outputs.
	#[arg(long, global = true, default_value_t = false)]
	pub dump: bool,

	/// Enable verbose output.
	#[arg(long, short, global = true, default_value_t = false)]
	pub verbose: bool,

	/// Disable colored output.
	#[arg(long, global = true, default_value_t = false)]
	pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Run every configured step. This is the default command.
	Run,
	/// List every function templates can call, with the backend serving it.
	///
	/// Without `--step` only the built-in functions are listed. With a step
	/// name the step's scripts are compiled and listed in the configured
	/// backend order.
	Functions {
		/// Include the script functions of this step.
		#[arg(long)]
		step: Option<String>,

		/// Output format.
		#[arg(long, value_enum, default_value_t = OutputFormat::Text)]
		format: OutputFormat,
	},
	/// Inspect the content cache file.
	///
	/// Reports whether the cache exists, whether it was written by this version
	/// of kiln and how many files it tracks.
	Cache {
		/// Output format.
		#[arg(long, value_enum, default_value_t = OutputFormat::Text)]
		format: OutputFormat,
	},
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
	/// Human-readable text output.
	Text,
	/// JSON output for programmatic consumption.
	Json,
}

/// Passthrough flags keyed by collaborator name.
pub type CollaboratorFlags = BTreeMap<String, Vec<String>>;

/// Separate `--<collaborator>:<flag>` arguments from the arguments clap
/// parses. Everything after a bare `--` is left untouched.
pub fn split_collaborator_flags<I, T>(args: I) -> (Vec<OsString>, CollaboratorFlags)
where
	I: IntoIterator<Item = T>,
	T: Into<OsString>,
{
	let mut remaining = Vec::new();
	let mut flags = CollaboratorFlags::new();
	let mut passthrough = false;

	for arg in args {
		let arg: OsString = arg.into();

		if passthrough {
			remaining.push(arg);
			continue;
		}

		if arg == "--" {
			passthrough = true;
			remaining.push(arg);
			continue;
		}

		match arg.to_str().and_then(collaborator_flag) {
			Some((collaborator, flag)) => {
				flags
					.entry(collaborator.to_string())
					.or_default()
					.push(flag.to_string());
			}
			None => remaining.push(arg),
		}
	}

	(remaining, flags)
}

fn collaborator_flag(arg: &str) -> Option<(&str, &str)> {
	let (collaborator, flag) = arg.strip_prefix("--")?.split_once(':')?;
	let valid_name = !collaborator.is_empty()
		&& collaborator
			.chars()
			.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'));

	(valid_name && !flag.is_empty()).then_some((collaborator, flag))
}
