//! Client-side resource and module readers.
//!
//! The evaluator calls back into the client to read URIs whose scheme a
//! registered reader declared at evaluator creation. Resources are read with
//! `read("myscheme:thing")`, modules with `import "myscheme:/thing.pkl"`.
//! Pkl caches both for the lifetime of an evaluator, so readers don't need
//! to.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::bridge::protocol::{ModuleReaderSpec, PathElement, ResourceReaderSpec};

/// Behaviour shared by resource and module readers.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Scheme this reader handles, without the trailing `:`.
    ///
    /// Compared case-sensitively with the scheme as the evaluator wrote it.
    /// The [`Url`] passed to the reader is the parsed form: its scheme is
    /// lowercased and `.`/`..` segments in hierarchical paths are resolved.
    fn scheme(&self) -> &str;

    /// Whether `import*` / `read*` globbing is supported.
    fn is_globbable(&self) -> bool;

    /// Whether URIs have hierarchy, i.e. start with `/` after the scheme.
    ///
    /// `flintstone:/persons/fred.pkl` names `fred.pkl` within `/persons/`;
    /// `flintstone:persons/fred.pkl` names `persons/fred.pkl` with no
    /// hierarchy.
    fn has_hierarchical_uris(&self) -> bool;

    /// Elements directly below `uri`. Only called for globbable readers, or
    /// hierarchical local ones; a non-hierarchical reader receives an empty
    /// path and should list everything.
    async fn list_elements(&self, uri: &Url) -> anyhow::Result<Vec<PathElement>>;
}

#[async_trait]
pub trait ResourceReader: Reader {
    async fn read(&self, uri: &Url) -> anyhow::Result<Vec<u8>>;
}

#[async_trait]
pub trait ModuleReader: Reader {
    /// Whether modules are local to the runtime; enables triple-dot imports.
    fn is_local(&self) -> bool;

    async fn read(&self, uri: &Url) -> anyhow::Result<String>;
}

/// Readers in registration order. Lookup is a linear scan for the first
/// exact scheme match.
pub struct ReaderRegistry<R: ?Sized> {
    readers: Vec<Arc<R>>,
}

impl<R: ?Sized> Default for ReaderRegistry<R> {
    fn default() -> Self {
        Self {
            readers: Vec::new(),
        }
    }
}

impl<R: ?Sized> Clone for ReaderRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            readers: self.readers.clone(),
        }
    }
}

impl<R: Reader + ?Sized> ReaderRegistry<R> {
    pub fn new(readers: Vec<Arc<R>>) -> Self {
        Self { readers }
    }

    pub fn register(&mut self, reader: Arc<R>) {
        self.readers.push(reader);
    }

    pub fn find(&self, scheme: &str) -> Option<&Arc<R>> {
        self.readers.iter().find(|r| r.scheme() == scheme)
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }
}

impl ReaderRegistry<dyn ResourceReader> {
    pub fn specs(&self) -> Vec<ResourceReaderSpec> {
        self.readers
            .iter()
            .map(|r| ResourceReaderSpec {
                scheme: r.scheme().to_string(),
                has_hierarchical_uris: r.has_hierarchical_uris(),
                is_globbable: r.is_globbable(),
            })
            .collect()
    }
}

impl ReaderRegistry<dyn ModuleReader> {
    pub fn specs(&self) -> Vec<ModuleReaderSpec> {
        self.readers
            .iter()
            .map(|r| ModuleReaderSpec {
                scheme: r.scheme().to_string(),
                has_hierarchical_uris: r.has_hierarchical_uris(),
                is_globbable: r.is_globbable(),
                is_local: r.is_local(),
            })
            .collect()
    }
}
