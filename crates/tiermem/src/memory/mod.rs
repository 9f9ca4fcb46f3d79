//! Memory entry model
//!
//! Defines the stored entry, its key and tier placement mask, plus the
//! sequencing, clock and tombstone primitives the manager builds on.

pub mod clock;
pub mod sequence;
pub mod tombstone;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use sequence::SequenceClock;
pub use tombstone::TombstoneRegistry;
pub use types::{
    DEFAULT_NAMESPACE, Durability, EntryKey, MemoryEntry, Metadata, SEARCHABLE_TAG, TierId,
    TierMask,
};
