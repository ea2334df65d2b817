//! Markdown-backed working memory.
//!
//! Each agent keeps one `MEMORY.md`: a frontmatter header plus headed
//! sections, addressed case-insensitively by title. Writes are size-capped
//! and versioned; every successful save bumps `version` so concurrent
//! writers can detect lost updates.

pub mod document;
pub mod store;

pub use document::{MemoryDocument, MemoryFrontmatter, MemorySection, truncate_to_budget};
pub use store::{
    MemoryReadout, MemoryStats, MemoryStore, MemoryUpdate, WriteOptions, WriteOutcome,
};
