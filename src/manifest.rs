//! Registry of transfer adapters by name and direction.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::{AdapterBase, Direction, TransferAdapter, TransferImpl};
use crate::config::TransferConfig;
use crate::custom::CustomTransfer;
use crate::download::{ResumableDownload, BASIC_ADAPTER_NAME, HTTP_RANGE_ADAPTER_NAME};
use crate::http::HttpClient;
use crate::storage::ObjectStore;
use crate::upload::BasicUpload;

/// Builds a fresh adapter for `(name, direction)`.
pub type AdapterConstructor = Arc<dyn Fn(&str, Direction) -> Box<dyn TransferAdapter> + Send + Sync>;

/// Wrap a strategy factory in the worker-pool runtime.
pub fn adapter_constructor<T, F>(build: F) -> AdapterConstructor
where
    T: TransferImpl,
    F: Fn(Direction) -> T + Send + Sync + 'static,
{
    Arc::new(move |name: &str, direction: Direction| -> Box<dyn TransferAdapter> {
        Box::new(AdapterBase::new(name, direction, build(direction)))
    })
}

/// Maps adapter names to constructors, separately for each direction.
///
/// Every lookup builds a new adapter instance, so concurrent batches never
/// share one.
pub struct Manifest {
    basic_transfers_only: bool,
    concurrent_transfers: usize,
    constructors: Mutex<HashMap<(Direction, String), AdapterConstructor>>,
}

impl Manifest {
    /// An empty registry.
    pub fn new(basic_transfers_only: bool, concurrent_transfers: usize) -> Self {
        Manifest {
            basic_transfers_only,
            concurrent_transfers: concurrent_transfers.max(1),
            constructors: Mutex::new(HashMap::new()),
        }
    }

    /// A registry with the built-in HTTP adapters and every configured
    /// custom adapter.
    pub fn configure(config: &TransferConfig, store: ObjectStore, http: HttpClient) -> Self {
        let manifest = Manifest::new(config.basic_transfers_only, config.concurrent_transfers);

        let download = ResumableDownload::basic(http.clone(), store.clone());
        manifest.register_adapter_constructor(
            BASIC_ADAPTER_NAME,
            Direction::Download,
            adapter_constructor(move |_| download.clone()),
        );

        let upload = BasicUpload::new(http.clone());
        manifest.register_adapter_constructor(
            BASIC_ADAPTER_NAME,
            Direction::Upload,
            adapter_constructor(move |_| upload.clone()),
        );

        let range = ResumableDownload::http_range(http.clone(), store);
        manifest.register_adapter_constructor(
            HTTP_RANGE_ADAPTER_NAME,
            Direction::Download,
            adapter_constructor(move |_| range.clone()),
        );

        for custom in &config.custom_adapters {
            for direction in [Direction::Download, Direction::Upload] {
                if !custom.direction.includes(direction) {
                    continue;
                }
                let (cfg, http) = (custom.clone(), http.clone());
                manifest.register_adapter_constructor(
                    &custom.name,
                    direction,
                    adapter_constructor(move |dir| CustomTransfer::new(cfg.clone(), dir, http.clone())),
                );
            }
        }

        manifest
    }

    /// Register (or replace) the constructor for `(name, direction)`.
    pub fn register_adapter_constructor(&self, name: &str, direction: Direction, ctor: AdapterConstructor) {
        self.constructors
            .lock()
            .insert((direction, name.to_string()), ctor);
    }

    /// Build a new adapter, or `None` if nothing is registered under `name`.
    pub fn new_adapter(&self, name: &str, direction: Direction) -> Option<Box<dyn TransferAdapter>> {
        // Clone out so the constructor runs without the lock held.
        let ctor = self
            .constructors
            .lock()
            .get(&(direction, name.to_string()))
            .cloned()?;
        Some(ctor(name, direction))
    }

    /// Build `name`, falling back to the basic adapter.
    ///
    /// Returns `None` only if not even the basic adapter is registered.
    pub fn new_adapter_or_default(&self, name: &str, direction: Direction) -> Option<Box<dyn TransferAdapter>> {
        if name.is_empty() {
            return self.new_adapter(BASIC_ADAPTER_NAME, direction);
        }
        match self.new_adapter(name, direction) {
            Some(adapter) => Some(adapter),
            None => {
                tracing::debug!(
                    "unknown {} adapter {:?}, defaulting to {:?}",
                    direction,
                    name,
                    BASIC_ADAPTER_NAME
                );
                self.new_adapter(BASIC_ADAPTER_NAME, direction)
            }
        }
    }

    /// Names usable for `direction`, sorted. Only the basic adapter when
    /// basic transfers are enforced.
    pub fn adapter_names(&self, direction: Direction) -> Vec<String> {
        if self.basic_transfers_only {
            return vec![BASIC_ADAPTER_NAME.to_string()];
        }
        let mut names: Vec<String> = self
            .constructors
            .lock()
            .keys()
            .filter(|(dir, _)| *dir == direction)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn upload_adapter_names(&self) -> Vec<String> {
        self.adapter_names(Direction::Upload)
    }

    pub fn download_adapter_names(&self) -> Vec<String> {
        self.adapter_names(Direction::Download)
    }

    pub fn new_upload_adapter(&self, name: &str) -> Option<Box<dyn TransferAdapter>> {
        self.new_adapter_or_default(name, Direction::Upload)
    }

    pub fn new_download_adapter(&self, name: &str) -> Option<Box<dyn TransferAdapter>> {
        self.new_adapter_or_default(name, Direction::Download)
    }

    pub fn basic_transfers_only(&self) -> bool {
        self.basic_transfers_only
    }

    /// Concurrency to pass to [`TransferAdapter::begin`].
    pub fn concurrent_transfers(&self) -> usize {
        self.concurrent_transfers
    }
}
