//! # Descriptor Loader Module
//!
//! Owns the runtime schema: a merged `FileDescriptorSet` plus the
//! [`DescriptorPool`] built from it. The loader is the single source of
//! truth for service, method and message lookups; replacement happens by
//! swapping the whole set under one write lock so concurrent readers only
//! ever observe a fully pre-swap or fully post-swap view.
//!
//! Merge semantics: files replace same-named entries and are appended
//! otherwise, so repeatedly loading the same protoset converges instead of
//! growing the file list and shadowing stale descriptors. Use the
//! `replace_*` operations to drop files that no longer exist upstream.

use parking_lot::RwLock;
use prost::Message;
use prost_reflect::{DescriptorPool, MessageDescriptor, ServiceDescriptor};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::path::Path;
use tracing::info;

use crate::core::error::GatewayResult;

/// Method metadata resolved from the descriptor set.
///
/// Input and output types are fully qualified message names, resolvable
/// through [`DescriptorLoader::find_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub service: String,
    pub name: String,
    pub input_type: String,
    pub output_type: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

struct Inner {
    files: Vec<FileDescriptorProto>,
    pool: DescriptorPool,
}

/// Loader and lookup table for runtime descriptor sets.
pub struct DescriptorLoader {
    inner: RwLock<Inner>,
}

impl DescriptorLoader {
    /// Create a loader with no descriptors. Lookups fail until a set is
    /// loaded.
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Inner {
                files: Vec::new(),
                pool: DescriptorPool::new(),
            }),
        }
    }

    /// Create a loader seeded from a serialized protoset file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let loader = Self::empty();
        loader.load_from_path(path)?;
        Ok(loader)
    }

    /// Create a loader seeded from serialized protoset bytes.
    pub fn from_bytes(data: &[u8]) -> GatewayResult<Self> {
        let loader = Self::empty();
        loader.load_from_bytes(data)?;
        Ok(loader)
    }

    /// Merge a protoset file into the current set.
    pub fn load_from_path<P: AsRef<Path>>(&self, path: P) -> GatewayResult<()> {
        let data = std::fs::read(path.as_ref())?;
        self.load_from_bytes(&data)
    }

    /// Merge serialized protoset bytes into the current set. Incoming
    /// files replace same-named entries and are appended otherwise.
    pub fn load_from_bytes(&self, data: &[u8]) -> GatewayResult<()> {
        let incoming = FileDescriptorSet::decode(data)?;

        let mut inner = self.inner.write();
        let mut merged = inner.files.clone();
        for file in incoming.file {
            match merged.iter_mut().find(|existing| existing.name == file.name) {
                Some(existing) => *existing = file,
                None => merged.push(file),
            }
        }

        // Build the candidate pool before committing so a malformed blob
        // never tears the visible set.
        let pool =
            DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: merged.clone() })?;
        let file_count = merged.len();
        inner.files = merged;
        inner.pool = pool;
        drop(inner);

        info!(files = file_count, "merged descriptor set");
        Ok(())
    }

    /// Replace the entire set with the contents of a protoset file.
    pub fn replace_from_path<P: AsRef<Path>>(&self, path: P) -> GatewayResult<()> {
        let data = std::fs::read(path.as_ref())?;
        self.replace_from_bytes(&data)
    }

    /// Replace the entire set in one write-locked step.
    pub fn replace_from_bytes(&self, data: &[u8]) -> GatewayResult<()> {
        let incoming = FileDescriptorSet::decode(data)?;
        let pool = DescriptorPool::from_file_descriptor_set(FileDescriptorSet {
            file: incoming.file.clone(),
        })?;

        let mut inner = self.inner.write();
        let file_count = incoming.file.len();
        inner.files = incoming.file;
        inner.pool = pool;
        drop(inner);

        info!(files = file_count, "replaced descriptor set");
        Ok(())
    }

    /// Look up a service by fully qualified name, e.g.
    /// `order.OrderService`.
    pub fn find_service(&self, full_name: &str) -> Option<ServiceDescriptor> {
        self.inner.read().pool.get_service_by_name(full_name)
    }

    /// Look up a method on a service. Returns the method's input/output
    /// type names and streaming flags.
    pub fn find_method(&self, service_name: &str, method_name: &str) -> Option<MethodInfo> {
        let inner = self.inner.read();
        let service = inner.pool.get_service_by_name(service_name)?;
        let method = service.methods().find(|m| m.name() == method_name)?;
        Some(MethodInfo {
            service: service.full_name().to_string(),
            name: method.name().to_string(),
            input_type: method.input().full_name().to_string(),
            output_type: method.output().full_name().to_string(),
            client_streaming: method.is_client_streaming(),
            server_streaming: method.is_server_streaming(),
        })
    }

    /// Look up a message by fully qualified name. Nested types resolve by
    /// dotted name, e.g. `order.Outer.Inner`.
    pub fn find_message(&self, full_name: &str) -> Option<MessageDescriptor> {
        self.inner.read().pool.get_message_by_name(full_name)
    }

    /// Number of files in the current set.
    pub fn file_count(&self) -> usize {
        self.inner.read().files.len()
    }
}
