//! Job discovery and the immutable job registry.

use crate::closure::{ClosureCodec, ClosureJob, ClosureRegistry};
use crate::definition::JobDefinition;
use crate::error::{DuplicateGroup, JobError, JobResult};
use crate::job::Job;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Root under which built-in jobs are recorded.
pub const BUILTIN_ROOT: &str = "<hopper>";

/// A group of job definitions living under one source root.
#[derive(Debug, Clone)]
pub struct JobSource {
    root: PathBuf,
    definitions: Vec<JobDefinition>,
}

impl JobSource {
    /// Creates an empty source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            definitions: Vec::new(),
        }
    }

    /// Adds a definition.
    pub fn register(mut self, definition: JobDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Adds a job whose handler is built with `Default`.
    #[track_caller]
    pub fn job<J: Job + Default>(self) -> Self {
        self.register(JobDefinition::of(J::default))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn definitions(&self) -> &[JobDefinition] {
        &self.definitions
    }
}

/// Collects job definitions from every source and builds the registry.
#[derive(Debug)]
pub struct JobDiscoverer {
    app_root: PathBuf,
    sources: Vec<JobSource>,
}

impl JobDiscoverer {
    /// Creates a discoverer reporting paths relative to `app_root`.
    pub fn new(app_root: impl Into<PathBuf>) -> Self {
        Self {
            app_root: app_root.into(),
            sources: Vec::new(),
        }
    }

    /// Adds a source root.
    pub fn add_source(mut self, source: JobSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Adds the built-in closure job.
    pub fn with_closures(self, codec: Arc<ClosureCodec>, closures: Arc<ClosureRegistry>) -> Self {
        let source = JobSource::new(BUILTIN_ROOT).register(
            ClosureJob::definition(codec, closures).with_source(PathBuf::from(BUILTIN_ROOT).join("closure")),
        );
        self.add_source(source)
    }

    /// Builds the registry.
    ///
    /// Definitions without a name are skipped. Any name declared more than
    /// once fails the whole discovery, listing every offending file.
    pub fn discover(self) -> JobResult<JobRegistry> {
        let mut by_name: BTreeMap<String, Vec<JobDefinition>> = BTreeMap::new();

        for source in self.sources {
            debug!(root = %source.root.display(), jobs = source.definitions.len(), "Scanning job source");
            for definition in source.definitions {
                if definition.name().trim().is_empty() {
                    debug!(source = %definition.source().display(), "Skipping unnamed job definition");
                    continue;
                }
                by_name
                    .entry(definition.name().to_string())
                    .or_default()
                    .push(definition);
            }
        }

        let duplicates: Vec<DuplicateGroup> = by_name
            .iter()
            .filter(|(_, defs)| defs.len() > 1)
            .map(|(name, defs)| DuplicateGroup {
                name: name.clone(),
                files: defs
                    .iter()
                    .map(|def| relative_to(&self.app_root, def.source()))
                    .collect(),
            })
            .collect();

        if !duplicates.is_empty() {
            return Err(JobError::DuplicateJobDefinition(duplicates));
        }

        let definitions: HashMap<String, Arc<JobDefinition>> = by_name
            .into_iter()
            .filter_map(|(name, mut defs)| defs.pop().map(|def| (name, Arc::new(def))))
            .collect();

        info!(count = definitions.len(), "Job registry built");
        Ok(JobRegistry { definitions })
    }
}

fn relative_to(root: &Path, file: &Path) -> String {
    file.strip_prefix(root)
        .unwrap_or(file)
        .display()
        .to_string()
}

/// Name to definition map, frozen after discovery.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    definitions: HashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
    /// Looks up a definition by name.
    pub fn resolve(&self, name: &str) -> JobResult<Arc<JobDefinition>> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::UnknownJobType(name.to_string()))
    }

    /// Looks up the definition of `J`.
    pub fn resolve_job<J: Job>(&self) -> JobResult<Arc<JobDefinition>> {
        self.resolve(&J::name())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
