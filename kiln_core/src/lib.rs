//! `kiln_core` is the engine behind [kiln](https://github.com/kiln-gen/kiln), an incremental,
//! template-driven code generator. Input files are parsed into attributed structural trees, filtered
//! by declarative conditions, and rendered through [`minijinja`](https://docs.rs/minijinja) templates.
//! A content-hash cache skips every input whose source and templates did not change since the last
//! run.
//!
//! ## Processing Pipeline
//!
//! ```text
//! input glob
//!   → Parser (input file → opaque document)
//!   → Converter (document → Node tree)
//!   → Condition (does this step apply?)
//!   → Renderer (templates + script functions → text)
//!   → Formatter (optional reformatting)
//!   → output/<input dir>/<stem><template suffix>
//! ```
//!
//! ## Modules
//!
//! - [`attributes`]: The attribute-pair grammar (`reflect, category=(name="io")`).
//! - [`cache`]: The content-hash cache deciding what to regenerate.
//! - [`condition`]: Boolean predicates over node attributes and their factory.
//! - [`config`]: `kiln.toml` loading, data files and resolved run options.
//! - [`frontend`]: Parser and converter contracts plus the built-in document frontend.
//! - [`render`]: Template search and the per-render context (`include`, `root`).
//! - [`pipeline`]: The step orchestrator.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use kiln_core::Collaborators;
//! use kiln_core::ConditionFactory;
//! use kiln_core::DocumentOptions;
//! use kiln_core::KilnConfig;
//! use kiln_core::Pipeline;
//! use kiln_core::RunOptions;
//!
//! let root = Path::new(".");
//! let config = KilnConfig::load(root).unwrap().unwrap_or_default();
//! let steps = config.steps(&ConditionFactory::default()).unwrap();
//! let options = RunOptions::from_config(root, Some(&config)).unwrap();
//! let collaborators = Collaborators::documents(&DocumentOptions::default());
//!
//! let report = Pipeline::new(options, steps, collaborators).run().unwrap();
//! println!("{} input(s) rendered", report.rendered());
//! ```

pub use attributes::*;
pub use cache::*;
pub use condition::*;
pub use config::*;
pub use error::*;
pub use format::*;
pub use frontend::*;
pub use natives::*;
pub use node::*;
pub use pipeline::*;
pub use render::*;
pub use script::*;

pub mod attributes;
pub mod cache;
pub mod condition;
pub mod config;
#[allow(unused_assignments)]
mod error;
mod format;
pub mod frontend;
mod natives;
mod node;
pub mod pipeline;
pub mod render;
mod script;

#[cfg(test)]
mod __fixtures;
