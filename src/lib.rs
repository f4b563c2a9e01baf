//! Structured diffs between partitioned virtual disk images.
//!
//! [`create::create_diff`] walks two images partition by partition and
//! writes a third image holding only what changed: text files as line
//! patches, other files whole, and registry hives as key/value diffs.
//! [`apply::apply_diff`] replays such an image onto a base.

pub mod apply;
pub mod config;
pub mod copy_queue;
pub mod create;
pub mod error;
pub mod hives;
pub mod patch_format;
pub mod policy;
pub mod registry;
pub mod text_diff;
pub mod text_patch;
pub mod tree_compare;
pub mod volume;

pub use apply::{apply_diff, ApplySummary};
pub use config::{ApplyRequest, CompareRequest, EngineConfig, PartitionPair};
pub use create::{create_diff, CompareSummary};
pub use error::{DiffError, EntryFailure, Result};
pub use patch_format::PatchScript;
pub use policy::ComparisonPolicy;
pub use text_diff::TextDiff;
pub use volume::{DiskFormat, DiskProvider, FsType};
