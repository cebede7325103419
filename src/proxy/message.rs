//! # Dynamic Message Construction
//!
//! The transcoder resolves message type names to descriptors through the
//! [`MessageBuilder`] capability. The production implementation,
//! [`PrototypeCache`], caches descriptor handles per fully qualified name;
//! every request then builds its own [`DynamicMessage`] from the handle,
//! so a cached instance is never shared and concurrent requests for the
//! same type cannot observe each other's field state.
//!
//! The cache is drained by the hot-reload driver whenever the descriptor
//! set is swapped, so stale prototypes never outlive a reload.

use parking_lot::RwLock;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::proto::loader::DescriptorLoader;

/// Capability for resolving message types at runtime. Tests substitute a
/// static fake; production uses [`PrototypeCache`].
pub trait MessageBuilder: Send + Sync {
    /// Resolve the descriptor for a fully qualified message name.
    fn message_descriptor(&self, full_name: &str) -> GatewayResult<MessageDescriptor>;

    /// Build a fresh, empty message of the named type. Each call returns a
    /// new instance.
    fn new_message(&self, full_name: &str) -> GatewayResult<DynamicMessage> {
        Ok(DynamicMessage::new(self.message_descriptor(full_name)?))
    }

    /// Drop every cached prototype. Invoked on descriptor-set swaps.
    fn clear(&self);
}

/// Descriptor-handle cache over the loader.
pub struct PrototypeCache {
    loader: Arc<DescriptorLoader>,
    cache: RwLock<HashMap<String, MessageDescriptor>>,
}

impl PrototypeCache {
    pub fn new(loader: Arc<DescriptorLoader>) -> Self {
        Self {
            loader,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Number of cached prototypes.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

impl MessageBuilder for PrototypeCache {
    fn message_descriptor(&self, full_name: &str) -> GatewayResult<MessageDescriptor> {
        if let Some(descriptor) = self.cache.read().get(full_name) {
            return Ok(descriptor.clone());
        }

        let descriptor =
            self.loader
                .find_message(full_name)
                .ok_or_else(|| GatewayError::MessageNotFound {
                    name: full_name.to_string(),
                })?;

        self.cache
            .write()
            .insert(full_name.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    fn clear(&self) {
        let mut cache = self.cache.write();
        let dropped = cache.len();
        cache.clear();
        if dropped > 0 {
            debug!(dropped, "cleared message prototype cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use prost_reflect::Value;
    use prost_types::{
        field_descriptor_proto, DescriptorProto, FieldDescriptorProto, FileDescriptorProto,
        FileDescriptorSet,
    };

    fn loader_with_greeting() -> Arc<DescriptorLoader> {
        let set = FileDescriptorSet {
            file: vec![FileDescriptorProto {
                name: Some("greet.proto".to_string()),
                package: Some("greet".to_string()),
                syntax: Some("proto3".to_string()),
                message_type: vec![DescriptorProto {
                    name: Some("Greeting".to_string()),
                    field: vec![
                        FieldDescriptorProto {
                            name: Some("msg".to_string()),
                            number: Some(1),
                            label: Some(field_descriptor_proto::Label::Optional as i32),
                            r#type: Some(field_descriptor_proto::Type::String as i32),
                            json_name: Some("msg".to_string()),
                            ..Default::default()
                        },
                        FieldDescriptorProto {
                            name: Some("count".to_string()),
                            number: Some(2),
                            label: Some(field_descriptor_proto::Label::Optional as i32),
                            r#type: Some(field_descriptor_proto::Type::Int64 as i32),
                            json_name: Some("count".to_string()),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };
        Arc::new(DescriptorLoader::from_bytes(&set.encode_to_vec()).unwrap())
    }

    #[test]
    fn test_cache_hit_and_clear() {
        let cache = PrototypeCache::new(loader_with_greeting());
        assert!(cache.is_empty());

        cache.message_descriptor("greet.Greeting").unwrap();
        assert_eq!(cache.len(), 1);
        cache.message_descriptor("greet.Greeting").unwrap();
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        // Resolvable again after a clear.
        cache.message_descriptor("greet.Greeting").unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_unknown_type_is_a_schema_miss() {
        let cache = PrototypeCache::new(loader_with_greeting());
        let err = cache.message_descriptor("greet.Missing").unwrap_err();
        assert!(matches!(err, GatewayError::MessageNotFound { .. }));
    }

    #[test]
    fn test_new_message_returns_fresh_instances() {
        let cache = PrototypeCache::new(loader_with_greeting());
        let mut first = cache.new_message("greet.Greeting").unwrap();
        first.set_field_by_name("msg", Value::String("hello".to_string()));

        // A second build must not observe the first request's fields.
        let second = cache.new_message("greet.Greeting").unwrap();
        assert_ne!(first, second);
        assert_eq!(
            second.get_field_by_name("msg").unwrap().as_str(),
            Some("")
        );
    }

    #[test]
    fn test_json_proto_round_trip() {
        let cache = PrototypeCache::new(loader_with_greeting());
        let mut message = cache.new_message("greet.Greeting").unwrap();
        message.set_field_by_name("msg", Value::String("hi".to_string()));
        message.set_field_by_name("count", Value::I64(7));

        let json = serde_json::to_vec(&message).unwrap();
        let mut deserializer = serde_json::Deserializer::from_slice(&json);
        let descriptor = cache.message_descriptor("greet.Greeting").unwrap();
        let decoded = DynamicMessage::deserialize(descriptor, &mut deserializer).unwrap();
        deserializer.end().unwrap();

        assert_eq!(message, decoded);
    }
}
