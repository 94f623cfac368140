//! Plugin library discovery and component construction.
//!
//! Scanning opens each library once to read its identity and catalogue, then closes it again.
//! A library is reopened only when one of its components is requested, and closed as soon as
//! the last component built from it is released. Each live [`Component`] holds a
//! [`LibraryLease`]; the lease count is the only thing that decides when a library closes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tonearm_types::{ComponentKind, ComponentName};

use crate::component::{Component, ComponentBody, ComponentContext, EngineServices};
use crate::error::RegistryError;
use crate::sync::lock;

/// One row of a library's component catalogue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogueEntry {
    pub component: String,
    pub kind: ComponentKind,
}

/// An opened plugin library. Dropping the last reference closes it.
pub trait PluginLibrary: Send + Sync {
    /// Module name; the first half of every [`ComponentName`] it provides.
    fn identity(&self) -> &str;
    fn catalogue(&self) -> Vec<CatalogueEntry>;

    /// Called after every open.
    fn install(&self) {}
    /// Called before every close.
    fn uninstall(&self) {}

    fn instantiate(
        self: Arc<Self>,
        component: &str,
        ctx: Arc<ComponentContext>,
    ) -> anyhow::Result<ComponentBody>;
}

/// Opens plugin libraries from paths.
pub trait LibraryLoader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Arc<dyn PluginLibrary>, RegistryError>;
}

struct LibrarySlot {
    library: Option<Arc<dyn PluginLibrary>>,
    active: usize,
}

struct LibraryInfo {
    path: PathBuf,
    identity: String,
    catalogue: Vec<CatalogueEntry>,
    loader: Arc<dyn LibraryLoader>,
    slot: Mutex<LibrarySlot>,
}

impl LibraryInfo {
    fn acquire(self: &Arc<Self>) -> Result<(LibraryLease, Arc<dyn PluginLibrary>), RegistryError> {
        let mut slot = lock(&self.slot);
        let library = match slot.library.clone() {
            Some(library) => library,
            None => {
                let library = self.loader.open(&self.path)?;
                if library.identity() != self.identity {
                    return Err(RegistryError::IdentityChanged {
                        path: self.path.clone(),
                        expected: self.identity.clone(),
                        found: library.identity().to_string(),
                    });
                }
                library.install();
                tracing::info!(module = %self.identity, path = ?self.path, "plugin library opened");
                slot.library = Some(library.clone());
                library
            }
        };
        slot.active += 1;
        Ok((LibraryLease { info: self.clone() }, library))
    }

    fn release_one(&self) {
        let mut slot = lock(&self.slot);
        if slot.active == 0 {
            tracing::error!(module = %self.identity, "library lease released with no active components");
            debug_assert!(false, "library active count underflow");
            return;
        }
        slot.active -= 1;
        if slot.active == 0
            && let Some(library) = slot.library.take()
        {
            library.uninstall();
            drop(library);
            tracing::info!(module = %self.identity, "plugin library closed");
        }
    }
}

/// Keeps one component's library open. Returned to the library exactly once, on drop.
pub struct LibraryLease {
    info: Arc<LibraryInfo>,
}

impl LibraryLease {
    pub fn module(&self) -> &str {
        &self.info.identity
    }
}

impl Drop for LibraryLease {
    fn drop(&mut self) {
        self.info.release_one();
    }
}

/// Introspection view of one registered library.
#[derive(Clone, Debug)]
pub struct LibrarySummary {
    pub path: PathBuf,
    pub module: String,
    pub open: bool,
    pub active: usize,
    pub components: Vec<CatalogueEntry>,
}

struct ComponentRecord {
    kind: ComponentKind,
    library: Arc<LibraryInfo>,
}

#[derive(Default)]
struct RegistryState {
    libraries: Vec<Arc<LibraryInfo>>,
    components: HashMap<ComponentName, ComponentRecord>,
}

/// All known plugin libraries and the components they offer.
pub struct Registry {
    loader: Arc<dyn LibraryLoader>,
    services: Arc<EngineServices>,
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new(loader: Arc<dyn LibraryLoader>, services: Arc<EngineServices>) -> Self {
        Self {
            loader,
            services,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Register every loadable library found directly inside `dirs`.
    ///
    /// Unreadable directories and rejected files are logged and skipped. Returns the number of
    /// libraries added by this call.
    pub fn scan<P: AsRef<Path>>(&self, dirs: &[P]) -> usize {
        let mut added = 0;
        for dir in dirs {
            let dir = dir.as_ref();
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = ?dir, "cannot read plugin directory: {e}");
                    continue;
                }
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file())
                .collect();
            paths.sort();

            for path in paths {
                if self.is_registered(&path) {
                    continue;
                }
                match self.probe(&path) {
                    Ok(()) => added += 1,
                    Err(e) => tracing::warn!(path = ?path, "skipping plugin library: {e}"),
                }
            }
        }
        tracing::info!(added, total = lock(&self.state).libraries.len(), "plugin scan finished");
        added
    }

    fn is_registered(&self, path: &Path) -> bool {
        lock(&self.state).libraries.iter().any(|l| l.path == path)
    }

    fn probe(&self, path: &Path) -> Result<(), RegistryError> {
        let library = self.loader.open(path)?;
        let identity = library.identity().to_string();
        if identity.is_empty() {
            return Err(RegistryError::EmptyIdentity {
                path: path.to_path_buf(),
            });
        }
        let catalogue = library.catalogue();
        drop(library);
        self.register(path.to_path_buf(), identity, catalogue, self.loader.clone())
    }

    /// Register an in-process library that is always available.
    pub fn register_builtin(&self, library: StaticLibrary) -> Result<(), RegistryError> {
        let key = format!("builtin:{}", library.identity);
        let identity = library.identity.clone();
        let catalogue = library.catalogue();
        let loader = Arc::new(StaticLoader::new().with_library(&key, library));
        self.register(PathBuf::from(key), identity, catalogue, loader)
    }

    fn register(
        &self,
        path: PathBuf,
        identity: String,
        catalogue: Vec<CatalogueEntry>,
        loader: Arc<dyn LibraryLoader>,
    ) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        if state.libraries.iter().any(|l| l.identity == identity) {
            return Err(RegistryError::DuplicateModule(identity));
        }
        let info = Arc::new(LibraryInfo {
            path,
            identity,
            catalogue,
            loader,
            slot: Mutex::new(LibrarySlot {
                library: None,
                active: 0,
            }),
        });
        for entry in &info.catalogue {
            state.components.insert(
                ComponentName::new(&info.identity, &entry.component),
                ComponentRecord {
                    kind: entry.kind,
                    library: info.clone(),
                },
            );
        }
        tracing::info!(
            module = %info.identity,
            path = ?info.path,
            components = info.catalogue.len(),
            "plugin library registered"
        );
        state.libraries.push(info);
        Ok(())
    }

    /// Instantiate `name`, opening its library if needed. `None` when unknown or on failure.
    pub fn find(&self, name: &ComponentName) -> Option<Component> {
        let record = lock(&self.state)
            .components
            .get(name)
            .map(|r| (r.kind, r.library.clone()));
        let Some((kind, info)) = record else {
            tracing::debug!(component = %name, "component not found");
            return None;
        };

        let (lease, library) = match info.acquire() {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(component = %name, "cannot open plugin library: {e}");
                return None;
            }
        };

        let ctx = Arc::new(ComponentContext::new(name.clone(), self.services.clone()));
        let built = library.instantiate(&name.component, ctx.clone());
        match built {
            Ok(body) if body.kind() == kind => {
                tracing::debug!(component = %name, id = %ctx.id(), %kind, "component created");
                Some(Component::new(ctx, body, Some(lease)))
            }
            Ok(body) => {
                tracing::warn!(
                    component = %name,
                    expected = %kind,
                    actual = %body.kind(),
                    "component kind does not match catalogue"
                );
                self.services.hooks.uninstall_all(ctx.id());
                drop(body);
                drop(lease);
                None
            }
            Err(e) => {
                tracing::warn!(component = %name, "component construction failed: {e:#}");
                self.services.hooks.uninstall_all(ctx.id());
                drop(lease);
                None
            }
        }
    }

    /// Like [`find`](Self::find) but only when the catalogue lists `name` as `kind`.
    pub fn find_kind(&self, name: &ComponentName, kind: ComponentKind) -> Option<Component> {
        match self.kind_of(name) {
            Some(found) if found == kind => self.find(name),
            Some(found) => {
                tracing::warn!(component = %name, expected = %kind, actual = %found, "wrong component kind");
                None
            }
            None => {
                tracing::debug!(component = %name, "component not found");
                None
            }
        }
    }

    /// Destroy `component` and return its library lease.
    pub fn release(&self, component: Component) {
        tracing::trace!(component = %component.name(), "releasing component");
        drop(component);
    }

    pub fn kind_of(&self, name: &ComponentName) -> Option<ComponentKind> {
        lock(&self.state).components.get(name).map(|r| r.kind)
    }

    /// Every known component, sorted by name. Available while libraries are closed.
    pub fn catalogue(&self) -> Vec<(ComponentName, ComponentKind)> {
        let mut all: Vec<_> = lock(&self.state)
            .components
            .iter()
            .map(|(name, r)| (name.clone(), r.kind))
            .collect();
        all.sort();
        all
    }

    pub fn libraries(&self) -> Vec<LibrarySummary> {
        lock(&self.state)
            .libraries
            .iter()
            .map(|info| {
                let slot = lock(&info.slot);
                LibrarySummary {
                    path: info.path.clone(),
                    module: info.identity.clone(),
                    open: slot.library.is_some(),
                    active: slot.active,
                    components: info.catalogue.clone(),
                }
            })
            .collect()
    }

    /// Live components built from `module`.
    pub fn active_count(&self, module: &str) -> Option<usize> {
        self.library(module).map(|info| lock(&info.slot).active)
    }

    pub fn is_open(&self, module: &str) -> Option<bool> {
        self.library(module)
            .map(|info| lock(&info.slot).library.is_some())
    }

    fn library(&self, module: &str) -> Option<Arc<LibraryInfo>> {
        lock(&self.state)
            .libraries
            .iter()
            .find(|l| l.identity == module)
            .cloned()
    }
}

type StaticFactory =
    Arc<dyn Fn(Arc<ComponentContext>) -> anyhow::Result<ComponentBody> + Send + Sync>;

/// A plugin library implemented in Rust and linked into the process.
pub struct StaticLibrary {
    identity: String,
    components: Vec<(CatalogueEntry, StaticFactory)>,
}

impl StaticLibrary {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            components: Vec::new(),
        }
    }

    pub fn component<F>(mut self, component: impl Into<String>, kind: ComponentKind, factory: F) -> Self
    where
        F: Fn(Arc<ComponentContext>) -> anyhow::Result<ComponentBody> + Send + Sync + 'static,
    {
        self.components.push((
            CatalogueEntry {
                component: component.into(),
                kind,
            },
            Arc::new(factory),
        ));
        self
    }

    fn catalogue(&self) -> Vec<CatalogueEntry> {
        self.components.iter().map(|(e, _)| e.clone()).collect()
    }
}

/// Open/close counters of a [`StaticLoader`].
#[derive(Debug, Default)]
pub struct LoaderStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub installs: AtomicUsize,
    pub uninstalls: AtomicUsize,
}

/// Serves [`StaticLibrary`] values keyed by file name, as if they were files on disk.
#[derive(Default)]
pub struct StaticLoader {
    libraries: HashMap<String, Arc<StaticLibrary>>,
    stats: Arc<LoaderStats>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_library(mut self, file_name: &str, library: StaticLibrary) -> Self {
        self.libraries.insert(file_name.to_string(), Arc::new(library));
        self
    }

    pub fn stats(&self) -> &LoaderStats {
        &self.stats
    }
}

impl LibraryLoader for StaticLoader {
    fn open(&self, path: &Path) -> Result<Arc<dyn PluginLibrary>, RegistryError> {
        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(library) = self.libraries.get(&key) else {
            return Err(RegistryError::Open {
                path: path.to_path_buf(),
                message: "no in-process library under this name".to_string(),
            });
        };
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(OpenStaticLibrary {
            library: library.clone(),
            stats: self.stats.clone(),
        }))
    }
}

struct OpenStaticLibrary {
    library: Arc<StaticLibrary>,
    stats: Arc<LoaderStats>,
}

impl Drop for OpenStaticLibrary {
    fn drop(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl PluginLibrary for OpenStaticLibrary {
    fn identity(&self) -> &str {
        &self.library.identity
    }

    fn catalogue(&self) -> Vec<CatalogueEntry> {
        self.library.catalogue()
    }

    fn install(&self) {
        self.stats.installs.fetch_add(1, Ordering::SeqCst);
    }

    fn uninstall(&self) {
        self.stats.uninstalls.fetch_add(1, Ordering::SeqCst);
    }

    fn instantiate(
        self: Arc<Self>,
        component: &str,
        ctx: Arc<ComponentContext>,
    ) -> anyhow::Result<ComponentBody> {
        let (_, factory) = self
            .library
            .components
            .iter()
            .find(|(entry, _)| entry.component == component)
            .ok_or_else(|| anyhow!("`{}` has no component `{component}`", self.library.identity))?;
        factory(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{self, FakeInput, RecordingOutput};
    use tonearm_types::{Event, EventKind};

    fn library(identity: &str) -> StaticLibrary {
        StaticLibrary::new(identity)
            .component("decoder", ComponentKind::StreamInput, |_| {
                Ok(ComponentBody::StreamInput(Box::new(FakeInput::new(1000))))
            })
            .component("speaker", ComponentKind::StreamOutput, |_| {
                Ok(ComponentBody::StreamOutput(Box::new(RecordingOutput::default())))
            })
            .component("broken", ComponentKind::SoundProcessor, |_| {
                Err(anyhow!("cannot build"))
            })
            .component("liar", ComponentKind::SoundProcessor, |_| {
                Ok(ComponentBody::StreamInput(Box::new(FakeInput::new(1))))
            })
    }

    fn fixture() -> (testkit::TestServices, Arc<StaticLoader>, Registry, tempfile::TempDir) {
        let services = testkit::TestServices::new();
        let dir = tempfile::tempdir().expect("tempdir");
        for file in ["good.so", "dup.so", "unknown.so", "noname.so"] {
            std::fs::write(dir.path().join(file), b"").expect("write");
        }
        std::fs::create_dir(dir.path().join("nested.so")).expect("mkdir");
        let loader = Arc::new(
            StaticLoader::new()
                .with_library("good.so", library("fake"))
                .with_library("dup.so", library("fake"))
                .with_library("noname.so", StaticLibrary::new("")),
        );
        let registry = Registry::new(loader.clone(), services.services.clone());
        (services, loader, registry, dir)
    }

    #[test]
    fn scan_skips_bad_libraries_and_closes_good_ones() {
        let (_services, loader, registry, dir) = fixture();
        let missing = dir.path().join("does-not-exist");
        assert_eq!(registry.scan(&[dir.path().to_path_buf(), missing]), 1);

        let stats = loader.stats();
        assert_eq!(stats.opens.load(Ordering::SeqCst), 3);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 3);
        assert_eq!(stats.installs.load(Ordering::SeqCst), 0);
        assert_eq!(registry.is_open("fake"), Some(false));
        assert_eq!(registry.catalogue().len(), 4);

        // A second scan registers nothing new.
        assert_eq!(registry.scan(&[dir.path()]), 0);
    }

    #[test]
    fn find_unknown_is_none() {
        let (_services, _loader, registry, dir) = fixture();
        registry.scan(&[dir.path()]);
        assert!(registry.find(&ComponentName::new("fake", "nope")).is_none());
        assert!(registry.find(&ComponentName::new("other", "decoder")).is_none());
        assert_eq!(registry.active_count("fake"), Some(0));
    }

    #[test]
    fn active_count_tracks_components_and_closes_at_zero() {
        let (_services, loader, registry, dir) = fixture();
        registry.scan(&[dir.path()]);
        let name = ComponentName::new("fake", "decoder");

        let first = registry.find(&name).expect("component");
        assert_eq!(first.kind(), ComponentKind::StreamInput);
        assert_eq!(registry.active_count("fake"), Some(1));
        assert_eq!(registry.is_open("fake"), Some(true));

        let second = registry
            .find(&ComponentName::new("fake", "speaker"))
            .expect("component");
        assert_eq!(registry.active_count("fake"), Some(2));
        assert_ne!(first.id(), second.id());

        let opens_before = loader.stats().opens.load(Ordering::SeqCst);
        registry.release(first);
        assert_eq!(registry.active_count("fake"), Some(1));
        assert_eq!(registry.is_open("fake"), Some(true));

        registry.release(second);
        assert_eq!(registry.active_count("fake"), Some(0));
        assert_eq!(registry.is_open("fake"), Some(false));
        assert_eq!(loader.stats().opens.load(Ordering::SeqCst), opens_before);
        assert_eq!(loader.stats().installs.load(Ordering::SeqCst), 1);
        assert_eq!(loader.stats().uninstalls.load(Ordering::SeqCst), 1);

        // Reopened on demand.
        let again = registry.find(&name).expect("component");
        assert_eq!(loader.stats().installs.load(Ordering::SeqCst), 2);
        drop(again);
        assert_eq!(registry.is_open("fake"), Some(false));
    }

    #[test]
    fn failed_construction_restores_count() {
        let (_services, _loader, registry, dir) = fixture();
        registry.scan(&[dir.path()]);
        assert!(registry.find(&ComponentName::new("fake", "broken")).is_none());
        assert!(registry.find(&ComponentName::new("fake", "liar")).is_none());
        assert_eq!(registry.active_count("fake"), Some(0));
        assert_eq!(registry.is_open("fake"), Some(false));
    }

    #[test]
    fn find_kind_checks_catalogue() {
        let (_services, _loader, registry, dir) = fixture();
        registry.scan(&[dir.path()]);
        let name = ComponentName::new("fake", "decoder");
        assert!(registry.find_kind(&name, ComponentKind::StreamOutput).is_none());
        assert!(registry.find_kind(&name, ComponentKind::StreamInput).is_some());
    }

    #[test]
    fn releasing_a_component_removes_its_hooks() {
        let services = testkit::TestServices::new();
        let library = StaticLibrary::new("scrobbler").component(
            "main",
            ComponentKind::Module,
            |ctx| {
                ctx.install_hook(EventKind::SongChange, |_: &Event| {});
                Ok(ComponentBody::Module(Box::new(testkit::NoopModule)))
            },
        );
        let registry = Registry::new(Arc::new(StaticLoader::new()), services.services.clone());
        registry.register_builtin(library).expect("register");

        let module = registry
            .find(&ComponentName::new("scrobbler", "main"))
            .expect("module");
        assert_eq!(services.hooks.installed_count(), 1);
        registry.release(module);
        assert_eq!(services.hooks.installed_count(), 0);
    }

    #[test]
    fn releasing_an_input_drops_its_private_file_data() {
        let (services, _loader, registry, dir) = fixture();
        registry.scan(&[dir.path()]);
        let input = registry
            .find(&ComponentName::new("fake", "decoder"))
            .expect("input");
        let file = services.audio_files.acquire("track.flac");
        file.set_private_data(input.id(), Box::new(42u32));

        registry.release(input);
        assert_eq!(file.private_data_owner(), None);
    }

    #[test]
    fn builtin_modules_must_be_unique() {
        let services = testkit::TestServices::new();
        let registry = Registry::new(Arc::new(StaticLoader::new()), services.services.clone());
        registry.register_builtin(StaticLibrary::new("x")).expect("first");
        assert!(matches!(
            registry.register_builtin(StaticLibrary::new("x")),
            Err(RegistryError::DuplicateModule(_))
        ));
        assert_eq!(registry.libraries().len(), 1);
    }
}
