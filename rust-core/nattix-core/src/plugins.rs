//! # Plugins
//!
//! A plugin is a folder under `plugins/` holding an `install.json` manifest
//! plus a compiled-in [`Plugin`] implementation registered under the
//! manifest `id`.
//!
//! Loading happens in two phases. [`load_plugins`] scans and validates the
//! manifests (folders in name order; a dependency must already be loaded
//! when its dependent is checked) and sorts the result by `index`.
//! [`PluginRegistry::boot`] then runs each implementation in that order.

use crate::error::{Error, Result};
use crate::json::read_json_file;
use crate::kernel::AppContext;
use crate::router::Router;
use semver::Version;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Manifest file name
pub const MANIFEST_FILE: &str = "install.json";

/// Contents of `install.json`
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// `false` (or any non-`true` value) disables the plugin
    #[serde(default)]
    pub active: Option<Value>,
    /// Display name, also what dependents refer to
    #[serde(default)]
    pub name: String,
    /// Author
    #[serde(default)]
    pub author: String,
    /// `x.y.z`
    #[serde(default)]
    pub version: String,
    /// Unique id, key of the implementation in the [`PluginRegistry`]
    #[serde(default)]
    pub id: String,
    /// Plugin name -> minimum version
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Load order, ascending
    #[serde(default)]
    pub index: i64,
    /// Whether the plugin contributes routes
    #[serde(default)]
    pub routes: bool,
}

impl Manifest {
    /// Whether the manifest switches the plugin off
    #[must_use]
    pub fn is_inactive(&self) -> bool {
        self.active.as_ref().is_some_and(|v| *v != Value::Bool(true))
    }
}

/// A directory found under the plugins folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFolder {
    /// Folder name
    pub name: String,
    /// Absolute path
    pub path: PathBuf,
    /// File names, when requested
    pub files: Vec<String>,
    /// Sub-folder names, when requested
    pub folders: Vec<String>,
}

/// Folder filter
pub type FolderFilter = Box<dyn Fn(&Path) -> bool + Send + Sync>;

/// How to scan the plugins folder
#[derive(Default)]
pub struct ScanOptions {
    /// Keep only folders the filter accepts
    pub filter: Option<FolderFilter>,
    /// List files and sub-folders of each plugin
    pub include_info: bool,
    /// Sub-folders every plugin must have (checked with `include_info`)
    pub required_folders: Vec<String>,
}

impl fmt::Debug for ScanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOptions")
            .field("filter", &self.filter.is_some())
            .field("include_info", &self.include_info)
            .field("required_folders", &self.required_folders)
            .finish()
    }
}

/// A validated plugin, ready to boot
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    /// Where it was found
    pub folder: PluginFolder,
    /// Its manifest
    pub manifest: Manifest,
    /// Random id assigned for this load
    pub unique_id: String,
}

fn sorted_entries(dir: &Path) -> Result<Vec<(String, PathBuf, bool)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type()?.is_dir();
        entries.push((name, entry.path(), is_dir));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// List plugin folders, sorted by name
///
/// A missing plugins directory yields no folders.
///
/// # Errors
///
/// `Io` on unreadable directories, `PluginValidation` when a required
/// sub-folder is missing.
pub fn scan_plugin_folders(dir: &Path, options: &ScanOptions) -> Result<Vec<PluginFolder>> {
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "No plugins directory");
        return Ok(Vec::new());
    }

    let mut result = Vec::new();
    for (name, path, is_dir) in sorted_entries(dir)? {
        if !is_dir {
            continue;
        }
        if let Some(filter) = &options.filter {
            if !filter(&path) {
                continue;
            }
        }

        let mut folder = PluginFolder {
            name,
            path,
            files: Vec::new(),
            folders: Vec::new(),
        };
        if options.include_info {
            for (entry, _, is_dir) in sorted_entries(&folder.path)? {
                if is_dir {
                    folder.folders.push(entry);
                } else {
                    folder.files.push(entry);
                }
            }
            let missing: Vec<&str> = options
                .required_folders
                .iter()
                .filter(|required| !folder.folders.contains(*required))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(Error::plugin(
                    &folder.name,
                    format!("missing required folder(s): {}", missing.join(", ")),
                ));
            }
        }
        result.push(folder);
    }
    Ok(result)
}

fn is_plain_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Parse a minimum version, accepting `x`, `x.y` and `x.y.z`
fn parse_minimum(version: &str) -> Option<Version> {
    let mut parts: Vec<&str> = version.trim().split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts.join(".")).ok()
}

/// Scan, validate and order the plugins in `dir`
///
/// Checks, per plugin in scan order: inactive plugins are skipped; `name`,
/// `author`, `version` and `id` must be set; `version` must be `x.y.z`;
/// ids are unique; every dependency is already loaded at a version no
/// lower than required.
///
/// # Errors
///
/// `PluginValidation` for the first plugin failing a check.
pub fn load_plugins(dir: &Path, options: &ScanOptions) -> Result<Vec<LoadedPlugin>> {
    let mut loaded: Vec<LoadedPlugin> = Vec::new();

    for folder in scan_plugin_folders(dir, options)? {
        let manifest_path = folder.path.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            debug!(plugin = %folder.name, "No manifest, skipping folder");
            continue;
        }
        let manifest: Manifest = read_json_file(&manifest_path)
            .map_err(|e| Error::plugin(&folder.name, format!("cannot decode {MANIFEST_FILE}: {e}")))?;

        if manifest.is_inactive() {
            info!(plugin = %folder.name, "Plugin inactive, skipping");
            continue;
        }
        validate(&folder, &manifest, &loaded)?;

        loaded.push(LoadedPlugin {
            unique_id: format!("plugin_{}", Uuid::new_v4().simple()),
            folder,
            manifest,
        });
    }

    loaded.sort_by_key(|p| p.manifest.index);
    Ok(loaded)
}

fn validate(folder: &PluginFolder, manifest: &Manifest, loaded: &[LoadedPlugin]) -> Result<()> {
    let plugin = folder.name.as_str();
    for (field, value) in [
        ("version", &manifest.version),
        ("name", &manifest.name),
        ("author", &manifest.author),
        ("id", &manifest.id),
    ] {
        if value.trim().is_empty() {
            return Err(Error::plugin(plugin, format!("'{field}' is empty in {MANIFEST_FILE}")));
        }
    }

    if !is_plain_version(&manifest.version) {
        return Err(Error::plugin(
            plugin,
            format!(
                "invalid version '{}', expected x.y.z with non-negative integers",
                manifest.version
            ),
        ));
    }

    if loaded.iter().any(|p| p.manifest.id == manifest.id) {
        return Err(Error::plugin(plugin, format!("duplicate id '{}'", manifest.id)));
    }

    for (dependency, required) in &manifest.dependencies {
        let Some(found) = loaded.iter().find(|p| &p.manifest.name == dependency) else {
            return Err(Error::plugin(
                plugin,
                format!("requires '{dependency}', but it is not loaded"),
            ));
        };
        let minimum = parse_minimum(required).ok_or_else(|| {
            Error::plugin(plugin, format!("invalid version requirement '{required}' for '{dependency}'"))
        })?;
        let present = Version::parse(&found.manifest.version)
            .map_err(|e| Error::plugin(plugin, format!("bad version of '{dependency}': {e}")))?;
        if present < minimum {
            return Err(Error::plugin(
                plugin,
                format!(
                    "requires version {required} or higher of '{dependency}', but loaded version is {present}"
                ),
            ));
        }
    }
    Ok(())
}

/// Compiled-in plugin behaviour
pub trait Plugin: Send + Sync {
    /// Runs once at load, in `index` order (register hooks, bindings...)
    ///
    /// # Errors
    ///
    /// Any error aborts plugin loading.
    fn boot(&self, ctx: &AppContext) -> Result<()>;

    /// Adds routes; called after `boot` when the manifest sets `routes`
    ///
    /// # Errors
    ///
    /// Route registration errors.
    fn routes(&self, _router: &mut Router) -> Result<()> {
        Ok(())
    }
}

/// Plugin implementations by manifest id
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.plugins.keys().collect();
        ids.sort();
        f.debug_struct("PluginRegistry").field("ids", &ids).finish()
    }
}

impl PluginRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the implementation for manifest `id`
    pub fn register<P: Plugin + 'static>(&mut self, id: &str, plugin: P) {
        self.plugins.insert(id.to_string(), Arc::new(plugin));
    }

    /// Whether `id` has an implementation
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    /// Boot validated plugins in order, then let routed ones add routes
    ///
    /// # Errors
    ///
    /// `PluginNotRegistered` when a manifest id has no implementation;
    /// otherwise the first `boot`/`routes` error.
    pub fn boot(&self, loaded: &[LoadedPlugin], ctx: &AppContext, router: &mut Router) -> Result<()> {
        for plugin in loaded {
            let implementation =
                self.plugins
                    .get(&plugin.manifest.id)
                    .ok_or_else(|| Error::PluginNotRegistered {
                        plugin: plugin.folder.name.clone(),
                        id: plugin.manifest.id.clone(),
                    })?;

            implementation.boot(ctx)?;
            if plugin.manifest.routes {
                implementation.routes(router)?;
            }
            info!(
                plugin = %plugin.manifest.name,
                version = %plugin.manifest.version,
                index = plugin.manifest.index,
                "Plugin loaded"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;

    fn plugin_dir(plugins: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (folder, manifest) in plugins {
            let path = dir.path().join(folder);
            fs::create_dir_all(&path).unwrap();
            if !manifest.is_empty() {
                fs::write(path.join(MANIFEST_FILE), manifest).unwrap();
            }
        }
        dir
    }

    const CORE: &str = r#"{"active": true, "name": "Core", "author": "Celio", "version": "1.2.0", "id": "core", "index": 2}"#;

    #[test]
    fn test_dependency_version_mismatch() {
        let dir = plugin_dir(&[
            ("a_core", CORE),
            (
                "b_blog",
                r#"{"name": "Blog", "author": "Celio", "version": "0.1.0", "id": "blog",
                    "dependencies": {"Core": "2.0.0"}}"#,
            ),
        ]);
        let err = load_plugins(dir.path(), &ScanOptions::default()).unwrap_err();
        match err {
            Error::PluginValidation { plugin, reason } => {
                assert_eq!(plugin, "b_blog");
                assert!(reason.contains("requires version 2.0.0 or higher of 'Core'"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_satisfied_dependencies_sorted_by_index() {
        let dir = plugin_dir(&[
            ("a_core", CORE),
            (
                "b_blog",
                r#"{"name": "Blog", "author": "Celio", "version": "0.1.0", "id": "blog",
                    "dependencies": {"Core": "1.1"}, "index": 1}"#,
            ),
            ("c_notes", ""),
            (
                "d_off",
                r#"{"active": false, "name": "Off", "author": "x", "version": "bad", "id": "off"}"#,
            ),
        ]);
        let loaded = load_plugins(dir.path(), &ScanOptions::default()).unwrap();
        let ids: Vec<&str> = loaded.iter().map(|p| p.manifest.id.as_str()).collect();
        assert_eq!(ids, vec!["blog", "core"]);
        assert!(loaded[0].unique_id.starts_with("plugin_"));
    }

    #[test]
    fn test_missing_dependency_and_duplicates() {
        let dir = plugin_dir(&[(
            "blog",
            r#"{"name": "Blog", "author": "a", "version": "1.0.0", "id": "blog", "dependencies": {"Core": "1.0.0"}}"#,
        )]);
        assert!(matches!(
            load_plugins(dir.path(), &ScanOptions::default()),
            Err(Error::PluginValidation { reason, .. }) if reason.contains("not loaded")
        ));

        let dir = plugin_dir(&[("a", CORE), ("b", CORE)]);
        assert!(matches!(
            load_plugins(dir.path(), &ScanOptions::default()),
            Err(Error::PluginValidation { reason, .. }) if reason.contains("duplicate id")
        ));
    }

    #[test]
    fn test_manifest_field_checks() {
        let dir = plugin_dir(&[("a", r#"{"name": "A", "author": "", "version": "1.0.0", "id": "a"}"#)]);
        assert!(matches!(
            load_plugins(dir.path(), &ScanOptions::default()),
            Err(Error::PluginValidation { reason, .. }) if reason.contains("'author' is empty")
        ));

        let dir = plugin_dir(&[("a", r#"{"name": "A", "author": "x", "version": "1.0", "id": "a"}"#)]);
        assert!(matches!(
            load_plugins(dir.path(), &ScanOptions::default()),
            Err(Error::PluginValidation { reason, .. }) if reason.contains("invalid version")
        ));

        let dir = plugin_dir(&[("a", "{not json")]);
        assert!(matches!(
            load_plugins(dir.path(), &ScanOptions::default()),
            Err(Error::PluginValidation { .. })
        ));
    }

    #[test]
    fn test_scan_info_and_required_folders() {
        let dir = plugin_dir(&[("shop", CORE)]);
        fs::create_dir_all(dir.path().join("shop/assets")).unwrap();

        let options = ScanOptions {
            include_info: true,
            required_folders: vec!["assets".to_string()],
            ..ScanOptions::default()
        };
        let folders = scan_plugin_folders(dir.path(), &options).unwrap();
        assert_eq!(folders[0].files, vec![MANIFEST_FILE]);
        assert_eq!(folders[0].folders, vec!["assets"]);

        let strict = ScanOptions {
            include_info: true,
            required_folders: vec!["views".to_string()],
            ..ScanOptions::default()
        };
        assert!(scan_plugin_folders(dir.path(), &strict).is_err());

        let filtered = ScanOptions {
            filter: Some(Box::new(|path: &Path| !path.ends_with("shop"))),
            ..ScanOptions::default()
        };
        assert!(scan_plugin_folders(dir.path(), &filtered).unwrap().is_empty());
        assert!(scan_plugin_folders(&dir.path().join("nope"), &filtered)
            .unwrap()
            .is_empty());
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Plugin for Recorder {
        fn boot(&self, _ctx: &AppContext) -> Result<()> {
            self.log.lock().push(format!("boot:{}", self.name));
            Ok(())
        }

        fn routes(&self, router: &mut Router) -> Result<()> {
            self.log.lock().push(format!("routes:{}", self.name));
            router.get(
                &format!("/{}", self.name),
                crate::router::RouteTarget::closure(|_req, _res| async { Ok(Response::text("plugin")) }),
            )?;
            Ok(())
        }
    }

    #[test]
    fn test_boot_runs_in_index_order() {
        let dir = plugin_dir(&[
            ("a_core", CORE),
            (
                "b_blog",
                r#"{"name": "Blog", "author": "Celio", "version": "0.1.0", "id": "blog",
                    "dependencies": {"Core": "1.0.0"}, "index": 1, "routes": true}"#,
            ),
        ]);
        let loaded = load_plugins(dir.path(), &ScanOptions::default()).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::new();
        registry.register("core", Recorder { name: "core", log: Arc::clone(&log) });
        registry.register("blog", Recorder { name: "blog", log: Arc::clone(&log) });

        let ctx = AppContext::for_tests();
        let mut router = Router::new();
        registry.boot(&loaded, &ctx, &mut router).unwrap();

        assert_eq!(*log.lock(), vec!["boot:blog", "routes:blog", "boot:core"]);
        assert!(router.match_route(crate::router::Method::Get, "/blog").is_ok());
    }

    #[test]
    fn test_missing_implementation() {
        let dir = plugin_dir(&[("a_core", CORE)]);
        let loaded = load_plugins(dir.path(), &ScanOptions::default()).unwrap();
        let err = PluginRegistry::new()
            .boot(&loaded, &AppContext::for_tests(), &mut Router::new())
            .unwrap_err();
        assert!(matches!(err, Error::PluginNotRegistered { ref id, .. } if id == "core"));
    }
}
