//! # lfs-transfer
//!
//! Pure Rust transfer engine for Git LFS objects.
//!
//! This crate provides:
//! - A worker-pool runtime that runs any single-object transfer strategy
//!   concurrently, letting only one worker authenticate first
//! - Resumable HTTP downloads (`basic`, `http-range`) and HTTP uploads
//! - External agent programs speaking a line-oriented JSON protocol
//! - The pktline protocol over pooled `git-lfs-transfer` SSH sessions
//!
//! ## Example
//!
//! ```no_run
//! use lfs_transfer::{
//!     Direction, HttpClient, Link, Manifest, ObjectRef, ObjectStore, Oid, TransferConfig,
//! };
//!
//! let config = TransferConfig::default();
//! let store = ObjectStore::new(".git/lfs/objects");
//! let manifest = Manifest::configure(&config, store.clone(), HttpClient::new(&config.http));
//!
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let mut adapter = manifest.new_adapter_or_default("http-range", Direction::Download).unwrap();
//! adapter.begin(manifest.concurrent_transfers(), None, Some(tx)).unwrap();
//!
//! let oid: Oid = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f".parse().unwrap();
//! let object = ObjectRef::new("hello.txt", oid.clone(), 13, store.object_path(&oid))
//!     .with_link(Link::new("https://lfs.example.com/objects/dffd6021"));
//! adapter.add(object).unwrap();
//! adapter.end();
//!
//! for result in rx {
//!     println!("{}: {:?}", result.object.name(), result.error);
//! }
//! ```

mod adapter;
pub mod config;
mod custom;
mod download;
mod error;
mod gate;
mod http;
mod manifest;
mod object;
mod oid;
mod progress;
pub mod ssh;
mod storage;
mod upload;

pub use adapter::{AdapterBase, Direction, TransferAdapter, TransferImpl, TransferResult};
pub use config::{ConfigSource, CustomAdapterConfig, HttpConfig, TransferConfig};
pub use custom::CustomTransfer;
pub use download::{ResumableDownload, BASIC_ADAPTER_NAME, HTTP_RANGE_ADAPTER_NAME};
pub use error::{Error, Result};
pub use gate::{AuthGate, AuthSignal};
pub use http::HttpClient;
pub use manifest::{adapter_constructor, AdapterConstructor, Manifest};
pub use object::{Link, ObjectRef};
pub use oid::{ContentHasher, HashingReader, Oid};
pub use progress::{copy_with_callback, CallbackReader, ProgressCallback};
pub use storage::{rename_copy_permissions, ObjectStore};
pub use upload::BasicUpload;
