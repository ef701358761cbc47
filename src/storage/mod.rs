//! Volume-level storage: needle records, index files, superblocks, erasure
//! coded shard addressing and the backends they are written through.

pub mod backend;
pub mod erasure_coding;
pub mod idx;
pub mod needle;
pub mod super_block;
pub mod ttl;
pub mod types;
pub mod volume;

pub use backend::{BackendStorageFile, DiskFile, MemoryFile};
pub use needle::{FileId, Needle, NeedleFlags, VolumeId};
pub use super_block::{ReplicaPlacement, SuperBlock};
pub use ttl::Ttl;
pub use types::{Cookie, NeedleId, Offset, Size, Version};
pub use volume::Volume;
