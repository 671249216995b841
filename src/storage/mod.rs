//! On-disk layer: sparse data files, metadata records, disk-space probing
//!
//! ```text
//! <cache_directory>/
//!   <key>.bmv          - sparse data file, one per resource
//!   Metadata/<key>.bmm - versioned metadata record, atomic rewrite
//!   statistics.json    - best-effort aggregate counters
//! ```

pub mod disk;
pub mod file_slot;
pub mod metadata;
pub mod store;

pub use file_slot::FileSlotManager;
pub use metadata::{MetadataRecord, ResourceMetadata, METADATA_RECORD_VERSION};
pub use store::MetadataStore;
