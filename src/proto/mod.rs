//! Runtime protobuf schema management: the descriptor loader and the
//! hot-reload driver that keeps it fresh.

pub mod hot_reload;
pub mod loader;

pub use hot_reload::HotReloadManager;
pub use loader::{DescriptorLoader, MethodInfo};
