use std::collections::BTreeSet;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use globset::GlobBuilder;
use ignore::WalkBuilder;
use serde::Serialize;

use crate::BackendKind;
use crate::CacheLoad;
use crate::ChangeTracker;
use crate::Condition;
use crate::ContentCache;
use crate::Converter;
use crate::DocumentConverter;
use crate::DocumentOptions;
use crate::DocumentParser;
use crate::FormatterSet;
use crate::KilnError;
use crate::KilnResult;
use crate::MacroScripts;
use crate::NativeFunctions;
use crate::Parser;
use crate::Renderer;
use crate::RunOptions;
use crate::ScriptRegistry;
use crate::TemplateSearch;
use crate::config::DATA_KEY;

/// Template file extensions removed before the output suffix is derived.
pub const TEMPLATE_EXTENSIONS: [&str; 4] = ["j2", "jinja", "jinja2", "tmpl"];

/// Suffix appended to an input's stem when dumping the converted document.
pub const DUMP_SUFFIX: &str = ".kiln.json";

/// One generation step: every input matching `input` is rendered through
/// every template.
#[derive(Debug, Clone)]
pub struct Step {
	pub name: String,
	pub input: String,
	pub templates: Vec<PathBuf>,
	pub scripts: Vec<PathBuf>,
	pub condition: Option<Condition>,
}

/// The parser and converter used for every input of a run.
#[derive(Clone)]
pub struct Collaborators {
	pub parser: Arc<dyn Parser>,
	pub converter: Arc<dyn Converter>,
}

impl Collaborators {
	pub fn new(parser: Arc<dyn Parser>, converter: Arc<dyn Converter>) -> Self {
		Self { parser, converter }
	}

	/// The built-in JSON / YAML / TOML document frontend.
	pub fn documents(options: &DocumentOptions) -> Self {
		Self::new(
			Arc::new(DocumentParser::new(options)),
			Arc::new(DocumentConverter::new(options)),
		)
	}
}

impl std::fmt::Debug for Collaborators {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Collaborators").finish_non_exhaustive()
	}
}

/// Counts for one executed step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepReport {
	pub name: String,
	pub inputs: usize,
	pub rendered: usize,
	pub skipped: usize,
	pub filtered: usize,
	pub failed: usize,
	/// Every file written, sorted.
	pub written: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
	pub steps: Vec<StepReport>,
}

impl RunReport {
	pub fn rendered(&self) -> usize {
		self.steps.iter().map(|step| step.rendered).sum()
	}

	pub fn skipped(&self) -> usize {
		self.steps.iter().map(|step| step.skipped).sum()
	}

	pub fn filtered(&self) -> usize {
		self.steps.iter().map(|step| step.filtered).sum()
	}

	pub fn written(&self) -> impl Iterator<Item = &PathBuf> {
		self.steps.iter().flat_map(|step| step.written.iter())
	}
}

#[derive(Debug)]
enum InputOutcome {
	Skipped,
	Filtered,
	Rendered(Vec<PathBuf>),
}

#[derive(Debug)]
struct InputFailure {
	input: PathBuf,
	error: KilnError,
}

/// A step whose templates and scripts were resolved and compiled.
#[derive(Debug)]
struct PreparedStep<'a> {
	step: &'a Step,
	templates: Vec<PathBuf>,
	scripts: Vec<PathBuf>,
	renderer: Renderer,
}

/// Runs every step against the project described by [`RunOptions`].
#[derive(Debug)]
pub struct Pipeline {
	options: RunOptions,
	steps: Vec<Step>,
	collaborators: Collaborators,
	formatters: FormatterSet,
	natives: Arc<NativeFunctions>,
}

impl Pipeline {
	pub fn new(options: RunOptions, steps: Vec<Step>, collaborators: Collaborators) -> Self {
		Self {
			options,
			steps,
			collaborators,
			formatters: FormatterSet::new(),
			natives: Arc::new(NativeFunctions::new()),
		}
	}

	#[must_use]
	pub fn with_formatters(mut self, formatters: FormatterSet) -> Self {
		self.formatters = formatters;
		self
	}

	pub fn options(&self) -> &RunOptions {
		&self.options
	}

	pub fn steps(&self) -> &[Step] {
		&self.steps
	}

	/// Execute every step in order.
	///
	/// Templates and scripts of every step are resolved before anything runs.
	/// Per-input failures are collected and the first one is returned once
	/// the failing step has processed all of its inputs. The cache is saved
	/// in every case.
	pub fn run(&self) -> KilnResult<RunReport> {
		let prepared = self
			.steps
			.iter()
			.map(|step| self.prepare(step))
			.collect::<KilnResult<Vec<_>>>()?;

		let (cache, load) = ContentCache::load(&self.options.cache_path);
		match &load {
			CacheLoad::Missing => tracing::debug!("no cache found, every input is treated as changed"),
			CacheLoad::Loaded => tracing::debug!(entries = cache.len(), "cache loaded"),
			CacheLoad::VersionMismatch {
				schema_version,
				tool_version,
			} => {
				tracing::warn!(
					schema_version,
					tool_version = %tool_version,
					"cache was written by a different version and will be rebuilt"
				);
			}
			CacheLoad::Unreadable(reason) => {
				tracing::warn!("cache is unreadable and will be rebuilt: {reason}");
			}
		}

		let changes = ChangeTracker::new(&cache);
		let mut report = RunReport::default();
		let mut outcome = Ok(());
		for step in &prepared {
			match self.run_step(step, &changes) {
				Ok(step_report) => report.steps.push(step_report),
				Err(e) => {
					outcome = Err(e);
					break;
				}
			}
		}

		if let Err(e) = cache.save(&self.options.cache_path) {
			tracing::warn!(
				path = %self.options.cache_path.display(),
				"failed to save cache: {e}"
			);
		}

		outcome.map(|()| report)
	}

	/// The registry templates of `step` can call, in configured backend
	/// order.
	pub fn step_registry(&self, step: &Step) -> KilnResult<ScriptRegistry> {
		let scripts = self.resolve_scripts(step)?;
		self.build_registry(&scripts)
	}

	fn prepare<'a>(&self, step: &'a Step) -> KilnResult<PreparedStep<'a>> {
		let search = self.search();
		let templates = step
			.templates
			.iter()
			.map(|template| {
				search.resolve(template).ok_or_else(|| {
					KilnError::MissingTemplate {
						step: step.name.clone(),
						path: template.clone(),
					}
				})
			})
			.collect::<KilnResult<Vec<_>>>()?;

		let scripts = self.resolve_scripts(step)?;
		let registry = self.build_registry(&scripts)?;

		Ok(PreparedStep {
			step,
			templates,
			scripts,
			renderer: Renderer::new(search, Arc::new(registry)),
		})
	}

	fn search(&self) -> TemplateSearch {
		TemplateSearch::new(&self.options.root, self.options.template_roots.clone())
	}

	fn resolve_scripts(&self, step: &Step) -> KilnResult<Vec<PathBuf>> {
		let search = self.search();
		step.scripts
			.iter()
			.map(|script| {
				search.resolve(script).ok_or_else(|| {
					KilnError::MissingScript {
						step: step.name.clone(),
						path: script.clone(),
					}
				})
			})
			.collect()
	}

	fn build_registry(&self, scripts: &[PathBuf]) -> KilnResult<ScriptRegistry> {
		let mut registry = ScriptRegistry::new();
		let mut seen = BTreeSet::new();

		for kind in &self.options.backend_order {
			if !seen.insert(*kind) {
				continue;
			}

			match kind {
				BackendKind::Native => registry.push(self.natives.clone()),
				BackendKind::Scripts if !scripts.is_empty() => {
					let helpers = ScriptRegistry::new().with_backend(self.natives.clone());
					let compiled = MacroScripts::compile(scripts, Some(Arc::new(helpers)))?;
					registry.push(Arc::new(compiled));
				}
				BackendKind::Scripts => {}
			}
		}

		Ok(registry)
	}

	fn run_step(&self, prepared: &PreparedStep<'_>, changes: &ChangeTracker<'_>) -> KilnResult<StepReport> {
		let step = prepared.step;

		// Every template and script is checked so each hash is refreshed.
		let mut templates_unchanged = true;
		for file in prepared.templates.iter().chain(&prepared.scripts) {
			templates_unchanged &= changes.is_unchanged(file)?;
		}

		let (base, inputs) = self.expand_inputs(&step.input)?;
		tracing::info!(
			step = %step.name,
			inputs = inputs.len(),
			templates_unchanged,
			"running step"
		);

		let outcomes: Mutex<Vec<InputOutcome>> = Mutex::new(Vec::with_capacity(inputs.len()));
		let failures: Mutex<Vec<InputFailure>> = Mutex::new(Vec::new());

		let process = |input: &PathBuf| {
			match self.process_input(prepared, &base, input, changes, templates_unchanged) {
				Ok(outcome) => lock(&outcomes).push(outcome),
				Err(error) => {
					changes.invalidate(input);
					lock(&failures).push(InputFailure {
						input: input.clone(),
						error,
					});
				}
			}
		};
		let process = &process;

		if !self.options.parallel || inputs.len() <= 1 {
			inputs.iter().for_each(process);
		} else if self.options.jobs == 0 {
			std::thread::scope(|scope| {
				for input in &inputs {
					scope.spawn(move || process(input));
				}
			});
		} else {
			let next = AtomicUsize::new(0);
			let workers = self.options.jobs.min(inputs.len());
			std::thread::scope(|scope| {
				for _ in 0..workers {
					scope.spawn(|| {
						while let Some(input) = inputs.get(next.fetch_add(1, Ordering::Relaxed)) {
							process(input);
						}
					});
				}
			});
		}

		let outcomes = outcomes.into_inner().unwrap_or_else(PoisonError::into_inner);
		let failures = failures.into_inner().unwrap_or_else(PoisonError::into_inner);

		let mut report = StepReport {
			name: step.name.clone(),
			inputs: inputs.len(),
			failed: failures.len(),
			..StepReport::default()
		};

		for outcome in outcomes {
			match outcome {
				InputOutcome::Skipped => report.skipped += 1,
				InputOutcome::Filtered => report.filtered += 1,
				InputOutcome::Rendered(written) => {
					report.rendered += 1;
					report.written.extend(written);
				}
			}
		}
		report.written.sort();

		tracing::info!(
			step = %step.name,
			rendered = report.rendered,
			skipped = report.skipped,
			filtered = report.filtered,
			failed = report.failed,
			"step finished"
		);

		let mut failures = failures.into_iter();
		let Some(first) = failures.next() else {
			return Ok(report);
		};

		tracing::error!(step = %step.name, input = %first.input.display(), "{}", first.error);
		for failure in failures {
			tracing::error!(step = %step.name, input = %failure.input.display(), "{}", failure.error);
		}

		Err(first.error)
	}

	fn process_input(
		&self,
		prepared: &PreparedStep<'_>,
		base: &Path,
		input: &Path,
		changes: &ChangeTracker<'_>,
		templates_unchanged: bool,
	) -> KilnResult<InputOutcome> {
		let input_unchanged = changes.is_unchanged(input)?;
		if input_unchanged && templates_unchanged && !self.options.force {
			tracing::debug!(input = %input.display(), "unchanged, skipping");
			return Ok(InputOutcome::Skipped);
		}

		let ast = self
			.collaborators
			.parser
			.parse(&[input.to_path_buf()])
			.map_err(|e| with_input_path(e, input))?
			.into_iter()
			.next()
			.ok_or_else(|| {
				KilnError::Parse {
					path: input.to_path_buf(),
					reason: "the parser produced no document".to_string(),
				}
			})?;

		let node = self
			.collaborators
			.converter
			.convert(&ast)
			.map_err(|e| with_input_path(e, input))?;

		let output_dir = output_dir(&self.options.output, base, input);
		let stem = input_stem(input);
		let mut written = Vec::new();

		if self.options.dump {
			let dump_path = output_dir.join(format!("{stem}{DUMP_SUFFIX}"));
			let dump = serde_json::to_string_pretty(&node)
				.map_err(|e| KilnError::Unknown(format!("failed to serialize document: {e}")))?;
			write_output(&dump_path, &dump)?;
			written.push(dump_path);
		}

		if let Some(condition) = &prepared.step.condition {
			if !condition.matches(&node) {
				tracing::debug!(input = %input.display(), "condition not met, skipping");
				return Ok(InputOutcome::Filtered);
			}
		}

		let mut document = serde_json::to_value(&node)
			.map_err(|e| KilnError::Unknown(format!("failed to serialize document: {e}")))?;
		if let serde_json::Value::Object(root) = &mut document {
			root.insert(
				DATA_KEY.to_string(),
				serde_json::Value::Object(self.options.data.clone()),
			);
		}

		for template in &prepared.templates {
			let output_path = output_dir.join(format!("{stem}{}", template_suffix(template)));
			let rendered = prepared.renderer.render(template, &document)?;
			let rendered = if self.formatters.can_format(&output_path) {
				self.formatters.format(&output_path, rendered)
			} else {
				rendered
			};

			write_output(&output_path, &rendered)?;
			tracing::debug!(
				input = %input.display(),
				output = %output_path.display(),
				"rendered"
			);
			written.push(output_path);
		}

		Ok(InputOutcome::Rendered(written))
	}

	/// Files matching `pattern` under the project root, sorted, together with
	/// the directory output paths are made relative to.
	fn expand_inputs(&self, pattern: &str) -> KilnResult<(PathBuf, Vec<PathBuf>)> {
		let matcher = GlobBuilder::new(pattern)
			.literal_separator(true)
			.build()
			.map_err(|e| {
				KilnError::InvalidGlob {
					pattern: pattern.to_string(),
					reason: e.to_string(),
				}
			})?
			.compile_matcher();

		let root = &self.options.root;
		let base = root.join(glob_base(pattern));
		let absolute = Path::new(pattern).is_absolute();

		if base.is_file() {
			let parent = base.parent().map(Path::to_path_buf).unwrap_or_default();
			return Ok((parent, vec![base]));
		}

		let mut inputs = Vec::new();
		if base.is_dir() {
			for entry in WalkBuilder::new(&base).standard_filters(false).build() {
				let entry = entry.map_err(|e| KilnError::InvalidInput(e.to_string()))?;
				if !entry.file_type().is_some_and(|file_type| file_type.is_file()) {
					continue;
				}

				let path = entry.path();
				let candidate = if absolute {
					path
				} else {
					path.strip_prefix(root).unwrap_or(path)
				};

				if matcher.is_match(candidate) {
					inputs.push(path.to_path_buf());
				}
			}
		}

		inputs.sort();
		Ok((base, inputs))
	}
}

/// The output suffix for a template: trailing template extension removed,
/// then everything from the first `.` (`reflect.gen.h.j2` → `.gen.h`). A name
/// without a dot yields `.<name>`.
pub fn template_suffix(template: &Path) -> String {
	let file_name = template
		.file_name()
		.map(|name| name.to_string_lossy().to_string())
		.unwrap_or_default();

	let mut name = file_name.as_str();
	if let Some((head, extension)) = name.rsplit_once('.') {
		if !head.is_empty() && TEMPLATE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()) {
			name = head;
		}
	}

	match name.find('.') {
		Some(index) => name[index..].to_string(),
		None => format!(".{name}"),
	}
}

/// `output/<input dir relative to base>`.
pub fn output_dir(output: &Path, base: &Path, input: &Path) -> PathBuf {
	let relative = input
		.parent()
		.and_then(|parent| parent.strip_prefix(base).ok())
		.unwrap_or_else(|| Path::new(""));

	output.join(relative)
}

/// The literal directory prefix of a glob: every leading component without
/// glob metacharacters.
pub fn glob_base(pattern: &str) -> PathBuf {
	let mut base = PathBuf::new();
	for component in Path::new(pattern).components() {
		let literal = match component {
			Component::Normal(part) => {
				!part
					.to_string_lossy()
					.contains(['*', '?', '[', ']', '{', '}'])
			}
			_ => true,
		};

		if !literal {
			break;
		}
		base.push(component.as_os_str());
	}

	base
}

fn input_stem(input: &Path) -> String {
	input
		.file_stem()
		.map(|stem| stem.to_string_lossy().to_string())
		.unwrap_or_default()
}

fn write_output(path: &Path, content: &str) -> KilnResult<()> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).map_err(|e| KilnError::file_io(parent, e))?;
	}

	std::fs::write(path, content).map_err(|e| KilnError::file_io(path, e))
}

/// Collaborators do not always know which input they were handed.
fn with_input_path(error: KilnError, input: &Path) -> KilnError {
	match error {
		KilnError::Parse { path, reason } if path.as_os_str().is_empty() => {
			KilnError::Parse {
				path: input.to_path_buf(),
				reason,
			}
		}
		KilnError::Conversion { path, reason } if path.as_os_str().is_empty() => {
			KilnError::Conversion {
				path: input.to_path_buf(),
				reason,
			}
		}
		other => other,
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
