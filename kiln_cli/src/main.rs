use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use kiln_cli::CollaboratorFlags;
use kiln_cli::Commands;
use kiln_cli::KilnCli;
use kiln_cli::OutputFormat;
use kiln_cli::split_collaborator_flags;
use kiln_core::Collaborators;
use kiln_core::ConditionFactory;
use kiln_core::DEFAULT_CACHE_PATH;
use kiln_core::DocumentOptions;
use kiln_core::FormatterSet;
use kiln_core::KilnConfig;
use kiln_core::KilnError;
use kiln_core::KilnResult;
use kiln_core::NativeFunctions;
use kiln_core::Pipeline;
use kiln_core::RunOptions;
use kiln_core::RunReport;
use kiln_core::ScriptRegistry;
use kiln_core::inspect_cache;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter, e.g. `KILN_LOG=debug`.
const LOG_ENV: &str = "KILN_LOG";

static USE_COLOR: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

fn color_enabled() -> bool {
	USE_COLOR.load(std::sync::atomic::Ordering::Relaxed)
}

/// Apply ANSI color codes only when color is enabled.
macro_rules! colored {
	($text:expr,green) => {
		if color_enabled() {
			format!("{}", $text.green())
		} else {
			format!("{}", $text)
		}
	};
	($text:expr,yellow) => {
		if color_enabled() {
			format!("{}", $text.yellow())
		} else {
			format!("{}", $text)
		}
	};
	($text:expr,bold) => {
		if color_enabled() {
			format!("{}", $text.bold())
		} else {
			format!("{}", $text)
		}
	};
}

fn main() {
	let (raw_args, collaborator_flags) = split_collaborator_flags(std::env::args_os());
	let args = KilnCli::parse_from(raw_args);

	// Respect NO_COLOR env var and --no-color flag.
	let use_color = !args.no_color && std::env::var_os("NO_COLOR").is_none();
	if !use_color {
		USE_COLOR.store(false, std::sync::atomic::Ordering::Relaxed);
	}

	miette::set_hook(Box::new(move |_| {
		Box::new(
			miette::MietteHandlerOpts::new()
				.color(use_color)
				.unicode(use_color)
				.build(),
		)
	}))
	.ok();

	init_tracing(args.verbose, use_color);

	let result = match &args.command {
		None | Some(Commands::Run) => run_generate(&args, &collaborator_flags),
		Some(Commands::Functions { step, format }) => run_functions(&args, step.as_deref(), *format),
		Some(Commands::Cache { format }) => run_cache(&args, *format),
	};

	if let Err(e) = result {
		let code = e.kind().exit_code();
		let report: miette::Report = e.into();
		eprintln!("{report:?}");
		process::exit(code);
	}
}

fn init_tracing(verbose: bool, use_color: bool) {
	let default_level = if verbose { "debug" } else { "info" };
	let filter =
		EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_ansi(use_color)
		.with_target(false)
		.init();
}

fn resolve_root(args: &KilnCli) -> PathBuf {
	args.path
		.clone()
		.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// The explicit `--config` file, or the first config discovered under `root`.
fn load_config(args: &KilnCli, root: &Path) -> KilnResult<Option<KilnConfig>> {
	match &args.config {
		Some(path) => KilnConfig::load_file(path).map(Some),
		None => KilnConfig::load(root),
	}
}

fn run_options(args: &KilnCli, root: &Path, config: Option<&KilnConfig>) -> KilnResult<RunOptions> {
	let mut options = RunOptions::from_config(root, config)?;

	if let Some(output) = &args.output {
		options.output = root.join(output);
	}

	if let Some(cache) = &args.cache {
		options.cache_path = root.join(cache);
	}

	if !args.template_roots.is_empty() {
		let configured = std::mem::take(&mut options.template_roots);
		options.template_roots = args.template_roots.iter().cloned().chain(configured).collect();
	}

	for argument in &args.data {
		options.insert_data_arg(argument)?;
	}

	options.force |= args.force;
	options.dump |= args.dump;
	if args.sequential {
		options.parallel = false;
	}
	if let Some(jobs) = args.jobs {
		options.jobs = jobs;
	}

	Ok(options)
}

fn formatters(args: &KilnCli, root: &Path, config: Option<&KilnConfig>) -> FormatterSet {
	if args.no_format {
		return FormatterSet::new();
	}

	let mut format = config.map(|config| config.format.clone()).unwrap_or_default();
	if let Some(command) = &args.format_command {
		format.command = Some(command.clone());
	}

	format.formatters(root)
}

fn collaborators(flags: &CollaboratorFlags) -> KilnResult<Collaborators> {
	let mut document = DocumentOptions::default();

	for (collaborator, values) in flags {
		match collaborator.as_str() {
			"document" => document = DocumentOptions::from_flags(values)?,
			other => {
				return Err(KilnError::InvalidInput(format!(
					"unknown collaborator `--{other}:`, the only collaborator is `document`"
				)));
			}
		}
	}

	Ok(Collaborators::documents(&document))
}

fn run_generate(args: &KilnCli, collaborator_flags: &CollaboratorFlags) -> KilnResult<()> {
	let root = resolve_root(args);
	let Some(config) = load_config(args, &root)? else {
		return Err(KilnError::InvalidInput(format!(
			"no kiln.toml found in `{}`, pass `--config` or create one",
			root.display()
		)));
	};

	let steps = config.steps(&ConditionFactory::default())?;
	if steps.is_empty() {
		return Err(KilnError::InvalidInput(
			"the config declares no [[steps]]".to_string(),
		));
	}

	let options = run_options(args, &root, Some(&config))?;
	let pipeline = Pipeline::new(options, steps, collaborators(collaborator_flags)?)
		.with_formatters(formatters(args, &root, Some(&config)));

	let report = pipeline.run()?;
	print_report(&report, &root);

	Ok(())
}

fn print_report(report: &RunReport, root: &Path) {
	for step in &report.steps {
		let mut line = format!(
			"{}: {} rendered, {} unchanged",
			colored!(step.name, bold),
			step.rendered,
			step.skipped
		);
		if step.filtered > 0 {
			line.push_str(&format!(", {} filtered out", step.filtered));
		}
		println!("{line}");

		for path in &step.written {
			println!("  {} {}", colored!("wrote", green), make_relative(path, root));
		}
	}

	if report.rendered() == 0 {
		println!("{}", colored!("Everything is up to date.", green));
	}
}

fn run_functions(args: &KilnCli, step: Option<&str>, format: OutputFormat) -> KilnResult<()> {
	let registry = match step {
		None => ScriptRegistry::new().with_backend(Arc::new(NativeFunctions::new())),
		Some(name) => {
			let root = resolve_root(args);
			let config = load_config(args, &root)?.unwrap_or_default();
			let steps = config.steps(&ConditionFactory::default())?;
			let Some(step) = steps.iter().find(|step| step.name == name).cloned() else {
				return Err(KilnError::InvalidInput(format!("no step named `{name}`")));
			};

			let options = run_options(args, &root, Some(&config))?;
			let pipeline = Pipeline::new(
				options,
				Vec::new(),
				Collaborators::documents(&DocumentOptions::default()),
			);
			pipeline.step_registry(&step)?
		}
	};

	let functions = registry.describe();
	match format {
		OutputFormat::Text => {
			for (name, backend) in &functions {
				println!("{name:<24} {}", colored!(backend, yellow));
			}
			println!("\n{} function(s)", functions.len());
		}
		OutputFormat::Json => {
			let entries: Vec<serde_json::Value> = functions
				.iter()
				.map(|(name, backend)| serde_json::json!({ "name": name, "backend": backend }))
				.collect();
			print_json(&serde_json::Value::Array(entries))?;
		}
	}

	Ok(())
}

fn run_cache(args: &KilnCli, format: OutputFormat) -> KilnResult<()> {
	let root = resolve_root(args);
	let config = load_config(args, &root)?;
	let configured = config.as_ref().and_then(|config| config.cache.clone());
	let cache_path = match args.cache.clone().or(configured) {
		Some(path) => root.join(path),
		None => root.join(DEFAULT_CACHE_PATH),
	};

	let inspection = inspect_cache(&cache_path);
	match format {
		OutputFormat::Text => {
			print_field("Path", make_relative(&inspection.path, &root));
			print_field("Exists", inspection.exists);
			print_field("Readable", inspection.readable);
			print_field("Valid", inspection.valid);
			print_field(
				"Schema version",
				inspection
					.schema_version
					.map_or_else(|| "-".to_string(), |version| version.to_string()),
			);
			print_field(
				"Tool version",
				inspection.tool_version.as_deref().unwrap_or("-"),
			);
			print_field("Entries", inspection.entry_count);

			if inspection.exists && !inspection.schema_supported {
				println!(
					"\n{}",
					colored!(
						"The cache was written by another version and will be rebuilt on the next \
						 run.",
						yellow
					)
				);
			}
		}
		OutputFormat::Json => {
			let value = serde_json::to_value(&inspection)
				.map_err(|e| KilnError::Unknown(format!("failed to serialize cache report: {e}")))?;
			print_json(&value)?;
		}
	}

	Ok(())
}

fn print_field(label: &str, value: impl std::fmt::Display) {
	println!("{label:<16} {value}");
}

fn print_json(value: &serde_json::Value) -> KilnResult<()> {
	let output = serde_json::to_string_pretty(value)
		.map_err(|e| KilnError::Unknown(format!("failed to serialize output: {e}")))?;
	println!("{output}");
	Ok(())
}

fn make_relative(path: &Path, root: &Path) -> String {
	path.strip_prefix(root)
		.unwrap_or(path)
		.display()
		.to_string()
}
