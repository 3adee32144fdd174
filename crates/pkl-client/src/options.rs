//! Options for creating an evaluator.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use url::Url;

use crate::bridge::protocol::{CreateEvaluator, ProjectOrDependency};
use crate::logging::{Logger, TracingLogger};
use crate::project::{Project, ProjectDependencies};
use crate::reader::{ModuleReader, ReaderRegistry, ResourceReader};

/// Renderer used for a module's `output.text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Jsonnet,
    Pcf,
    Plist,
    Properties,
    Textproto,
    Xml,
    Yaml,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonnet => "jsonnet",
            Self::Pcf => "pcf",
            Self::Plist => "plist",
            Self::Properties => "properties",
            Self::Textproto => "textproto",
            Self::Xml => "xml",
            Self::Yaml => "yaml",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const PRECONFIGURED_ALLOWED_RESOURCES: &[&str] = &[
    "http:",
    "https:",
    "file:",
    "env:",
    "prop:",
    "modulepath:",
    "package:",
    "projectpackage:",
];

const PRECONFIGURED_ALLOWED_MODULES: &[&str] = &[
    "pkl:",
    "repl:",
    "file:",
    "http:",
    "https:",
    "modulepath:",
    "package:",
    "projectpackage:",
];

/// Everything sent in CreateEvaluator, plus the client-side readers and log
/// sink the session will use. Unset fields are left to the evaluator's
/// defaults.
#[derive(Clone, Default)]
pub struct EvaluatorOptions {
    /// Properties for the `prop:` resource scheme.
    pub properties: Option<HashMap<String, String>>,
    /// Variables for the `env:` resource scheme.
    pub env: Option<HashMap<String, String>>,
    /// Directories and archives searched for `modulepath:` URIs.
    pub module_paths: Option<Vec<String>>,
    pub output_format: Option<OutputFormat>,
    /// URI patterns of modules that may be loaded.
    pub allowed_modules: Option<Vec<String>>,
    pub allowed_resources: Option<Vec<String>>,
    pub resource_readers: ReaderRegistry<dyn ResourceReader>,
    pub module_readers: ReaderRegistry<dyn ModuleReader>,
    /// Where `package:` modules are cached; no caching when unset.
    pub cache_dir: Option<String>,
    /// File reads past this directory fail.
    pub root_dir: Option<String>,
    /// Directory whose `PklProject.deps.json` resolves dependency imports.
    pub project_dir: Option<String>,
    pub declared_project_dependencies: Option<ProjectDependencies>,
    /// Receives the evaluator's log output. Defaults to [`TracingLogger`].
    pub logger: Option<Arc<dyn Logger>>,
}

impl EvaluatorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options matching the Pkl CLI defaults: the usual schemes allowed, the
    /// process environment visible, and `~/.pkl/cache` as package cache.
    pub fn preconfigured() -> Self {
        let cache_dir = dirs::home_dir().map(|home| home.join(".pkl/cache").display().to_string());
        Self {
            env: Some(std::env::vars().collect()),
            allowed_modules: Some(to_strings(PRECONFIGURED_ALLOWED_MODULES)),
            allowed_resources: Some(to_strings(PRECONFIGURED_ALLOWED_RESOURCES)),
            cache_dir,
            ..Self::default()
        }
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_module_paths(mut self, paths: Vec<String>) -> Self {
        self.module_paths = Some(paths);
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    pub fn with_allowed_modules(mut self, patterns: Vec<String>) -> Self {
        self.allowed_modules = Some(patterns);
        self
    }

    pub fn with_allowed_resources(mut self, patterns: Vec<String>) -> Self {
        self.allowed_resources = Some(patterns);
        self
    }

    pub fn with_resource_reader(mut self, reader: Arc<dyn ResourceReader>) -> Self {
        self.resource_readers.register(reader);
        self
    }

    pub fn with_module_reader(mut self, reader: Arc<dyn ModuleReader>) -> Self {
        self.module_readers.register(reader);
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<String>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_root_dir(mut self, dir: impl Into<String>) -> Self {
        self.root_dir = Some(dir.into());
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<String>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Fill options still unset from the project's evaluator settings, and
    /// point the evaluator at the project and its dependencies.
    pub fn with_project(mut self, project: &Project) -> Self {
        if let Some(settings) = &project.evaluator_settings {
            fill(&mut self.properties, &settings.external_properties);
            fill(&mut self.env, &settings.env);
            fill(&mut self.allowed_modules, &settings.allowed_modules);
            fill(&mut self.allowed_resources, &settings.allowed_resources);
            fill(&mut self.module_paths, &settings.module_path);
            fill(&mut self.root_dir, &settings.root_dir);
            if settings.no_cache == Some(true) {
                self.cache_dir = None;
            } else {
                fill(&mut self.cache_dir, &settings.module_cache_dir);
            }
        }
        if self.project_dir.is_none() {
            self.project_dir = Some(project.project_dir().to_string());
        }
        if self.declared_project_dependencies.is_none() {
            self.declared_project_dependencies = Some(project.dependencies.clone());
        }
        self
    }

    pub(crate) fn logger(&self) -> Arc<dyn Logger> {
        self.logger
            .clone()
            .unwrap_or_else(|| Arc::new(TracingLogger))
    }

    /// The CreateEvaluator frame for these options.
    pub(crate) fn to_create_request(&self, request_id: u64) -> CreateEvaluator {
        CreateEvaluator {
            request_id,
            client_resource_readers: non_empty(self.resource_readers.specs()),
            client_module_readers: non_empty(self.module_readers.specs()),
            module_paths: self.module_paths.clone(),
            env: self.env.clone(),
            properties: self.properties.clone(),
            output_format: self.output_format.map(|f| f.as_str().to_string()),
            allowed_modules: self.allowed_modules.clone(),
            allowed_resources: self.allowed_resources.clone(),
            root_dir: self.root_dir.clone(),
            cache_dir: self.cache_dir.clone(),
            project: self.project_descriptor(),
        }
    }

    fn project_descriptor(&self) -> Option<ProjectOrDependency> {
        let dir = self.project_dir.as_ref()?;
        let project_file = Path::new(dir).join("PklProject");
        let project_file_uri = Url::from_file_path(&project_file)
            .map(|u| u.to_string())
            .unwrap_or_else(|()| format!("file://{}", project_file.display()));
        Some(ProjectOrDependency {
            kind: None,
            package_uri: None,
            project_file_uri: Some(project_file_uri),
            checksums: None,
            dependencies: self
                .declared_project_dependencies
                .as_ref()
                .map(ProjectDependencies::encode),
        })
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(from);
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
