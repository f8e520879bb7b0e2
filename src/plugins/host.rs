//! The plugin host: manifest loading, dependency resolution and hook dispatch.

use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::handler::{CommandHandler, HookHandler};
use super::manifest::{ManifestIssue, PluginManifest};
use super::types::{HandlerResult, HookContext, HookEvent, HookOutcome, HookResult};
use crate::errors::PluginError;
use crate::tasks::panic_message;

/// Default per-handler timeout.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

struct Registration {
    plugin: String,
    handler_name: String,
    handler: Arc<dyn HookHandler>,
}

/// A plugin that passed validation and dependency resolution.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    /// Directory the manifest was discovered in
    pub source: Option<PathBuf>,
}

/// Result of discovering plugins in a directory.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<String>,
    /// (manifest path or plugin name, error)
    pub errors: Vec<(String, PluginError)>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Registry of hook name → ordered handler list.
pub struct PluginHost {
    registry: HashMap<HookEvent, Vec<Registration>>,
    plugins: Vec<LoadedPlugin>,
    hook_timeout: Duration,
}

impl Default for PluginHost {
    fn default() -> Self {
        Self::new(DEFAULT_HOOK_TIMEOUT)
    }
}

impl PluginHost {
    pub fn new(hook_timeout: Duration) -> Self {
        Self {
            registry: HashMap::new(),
            plugins: Vec::new(),
            hook_timeout,
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.manifest.name == name)
    }

    pub fn plugins(&self) -> &[LoadedPlugin] {
        &self.plugins
    }

    pub fn handler_count(&self, event: HookEvent) -> usize {
        self.registry.get(&event).map_or(0, Vec::len)
    }

    /// Register a single handler outside any manifest.
    pub fn register(
        &mut self,
        event: HookEvent,
        plugin: impl Into<String>,
        handler_name: impl Into<String>,
        handler: Arc<dyn HookHandler>,
    ) {
        self.registry.entry(event).or_default().push(Registration {
            plugin: plugin.into(),
            handler_name: handler_name.into(),
            handler,
        });
    }

    fn missing_dependencies(&self, manifest: &PluginManifest) -> Vec<String> {
        manifest
            .dependencies
            .iter()
            .filter(|dep| !self.is_loaded(dep))
            .cloned()
            .collect()
    }

    /// Check everything that would make a load fail, without registering anything.
    fn check_loadable(&self, manifest: &PluginManifest, source_name: &str) -> Result<(), PluginError> {
        manifest.ensure_valid(source_name)?;
        if self.is_loaded(&manifest.name) {
            return Err(PluginError::AlreadyLoaded(manifest.name.clone()));
        }
        let missing = self.missing_dependencies(manifest);
        if !missing.is_empty() {
            return Err(PluginError::UnresolvedDependencies {
                plugin: manifest.name.clone(),
                missing,
            });
        }
        Ok(())
    }

    fn commit_plugin(
        &mut self,
        manifest: PluginManifest,
        source: Option<PathBuf>,
        bindings: Vec<(HookEvent, String, Arc<dyn HookHandler>)>,
    ) {
        for (event, handler_name, handler) in bindings {
            self.register(event, manifest.name.clone(), handler_name, handler);
        }
        tracing::info!(plugin = %manifest.name, version = %manifest.version, "Plugin loaded");
        self.plugins.push(LoadedPlugin { manifest, source });
    }

    /// Load an in-process plugin whose handler references name entries in `handlers`.
    ///
    /// Nothing is registered unless the whole manifest is valid and every
    /// dependency is already loaded.
    pub fn load(
        &mut self,
        manifest: PluginManifest,
        handlers: HashMap<String, Arc<dyn HookHandler>>,
    ) -> Result<(), PluginError> {
        let source_name = manifest.name.clone();
        self.check_loadable(&manifest, &source_name)?;

        let mut issues = Vec::new();
        let mut bindings = Vec::new();
        for (event, reference) in manifest.hook_bindings() {
            match handlers.get(reference) {
                Some(handler) => bindings.push((event, reference.to_string(), handler.clone())),
                None => issues.push(ManifestIssue {
                    field: format!("hooks.{}", event),
                    message: format!("no handler named '{}'", reference),
                }),
            }
        }
        if !issues.is_empty() {
            return Err(PluginError::InvalidManifest {
                source_name,
                issues,
            });
        }

        self.commit_plugin(manifest, None, bindings);
        Ok(())
    }

    /// Load a plugin whose handlers are shell commands run from `plugin_dir`.
    pub fn load_command_plugin(
        &mut self,
        manifest: PluginManifest,
        plugin_dir: &Path,
    ) -> Result<(), PluginError> {
        let source_name = plugin_dir.display().to_string();
        self.check_loadable(&manifest, &source_name)?;

        let bindings = manifest
            .hook_bindings()
            .into_iter()
            .map(|(event, reference)| {
                let handler: Arc<dyn HookHandler> = Arc::new(CommandHandler::new(
                    manifest.command_for(reference),
                    plugin_dir,
                    &manifest.name,
                    self.hook_timeout,
                ));
                (event, reference.to_string(), handler)
            })
            .collect();

        self.commit_plugin(manifest, Some(plugin_dir.to_path_buf()), bindings);
        Ok(())
    }

    /// Load every `*/plugin.toml` or `*/plugin.json` under `dir`.
    ///
    /// Plugins are loaded in dependency order. Anything that cannot be loaded
    /// is reported, never partially registered.
    pub fn discover(&mut self, dir: &Path, disabled: &[String]) -> LoadReport {
        let mut report = LoadReport::default();
        let mut pending: Vec<(PluginManifest, PathBuf)> = Vec::new();

        for pattern in ["*/plugin.toml", "*/plugin.json"] {
            let pattern = dir.join(pattern).to_string_lossy().to_string();
            let paths = match glob::glob(&pattern) {
                Ok(paths) => paths,
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "Invalid plugin glob");
                    continue;
                }
            };
            for path in paths.filter_map(|p| p.ok()) {
                let source_name = path.display().to_string();
                let manifest = match PluginManifest::load(&path) {
                    Ok(m) => m,
                    Err(e) => {
                        report.errors.push((source_name, e));
                        continue;
                    }
                };
                if disabled.contains(&manifest.name) {
                    report.skipped.push(manifest.name);
                    continue;
                }
                if let Err(e) = manifest.ensure_valid(&source_name) {
                    report.errors.push((source_name, e));
                    continue;
                }
                let plugin_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
                pending.push((manifest, plugin_dir));
            }
        }

        // Fixed point: keep loading whatever has all dependencies present
        loop {
            let mut progressed = false;
            let mut still_pending = Vec::new();
            for (manifest, plugin_dir) in pending {
                if self.missing_dependencies(&manifest).is_empty() {
                    let name = manifest.name.clone();
                    match self.load_command_plugin(manifest, &plugin_dir) {
                        Ok(()) => {
                            report.loaded.push(name);
                            progressed = true;
                        }
                        Err(e) => report.errors.push((plugin_dir.display().to_string(), e)),
                    }
                } else {
                    still_pending.push((manifest, plugin_dir));
                }
            }
            pending = still_pending;
            if !progressed || pending.is_empty() {
                break;
            }
        }

        for (manifest, plugin_dir) in pending {
            let missing = self.missing_dependencies(&manifest);
            tracing::warn!(plugin = %manifest.name, missing = ?missing, "Plugin dependencies unresolved");
            report.errors.push((
                plugin_dir.display().to_string(),
                PluginError::UnresolvedDependencies {
                    plugin: manifest.name,
                    missing,
                },
            ));
        }

        report
    }

    /// Run every handler registered for `context.event`, in registration order.
    ///
    /// Handler errors, panics and timeouts become failed results. A handler
    /// that sets `stop_propagation` ends the invocation early.
    pub async fn execute(&self, context: &HookContext) -> HookOutcome {
        let mut outcome = HookOutcome::empty(context.event);
        let Some(registrations) = self.registry.get(&context.event) else {
            return outcome;
        };

        for (index, registration) in registrations.iter().enumerate() {
            let started = Instant::now();
            let call = AssertUnwindSafe(registration.handler.handle(context)).catch_unwind();
            let result = match tokio::time::timeout(self.hook_timeout, call).await {
                Ok(Ok(Ok(result))) => result,
                Ok(Ok(Err(e))) => HookResult::failed(format!("{:#}", e)),
                Ok(Err(panic)) => HookResult::failed(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )),
                Err(_) => HookResult::failed(format!(
                    "handler timed out after {}s",
                    self.hook_timeout.as_secs()
                )),
            };

            if !result.success {
                tracing::warn!(
                    event = %context.event,
                    plugin = %registration.plugin,
                    handler = %registration.handler_name,
                    error = result.error.as_deref().unwrap_or(""),
                    "Hook handler failed"
                );
            }

            let stop = result.stop_propagation;
            outcome.results.push(HandlerResult {
                plugin: registration.plugin.clone(),
                handler: registration.handler_name.clone(),
                result,
                duration_ms: started.elapsed().as_millis() as u64,
            });

            if stop {
                outcome.stopped_by = Some(registration.plugin.clone());
                outcome.skipped = registrations.len() - index - 1;
                tracing::debug!(
                    event = %context.event,
                    plugin = %registration.plugin,
                    skipped = outcome.skipped,
                    "Hook propagation stopped"
                );
                break;
            }
        }

        outcome
    }
}
