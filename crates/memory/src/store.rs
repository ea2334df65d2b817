//! Size-capped, versioned persistence for memory documents.
//!
//! All writes are read-modify-write of the whole `MEMORY.md` under a short
//! advisory file lock, finished with a write-to-temp + atomic rename so a
//! crash mid-write never leaves a torn document.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;

use va_domain::config::MemoryConfig;
use va_domain::error::{Error, Result};
use va_domain::trace::TraceEvent;

use crate::document::{truncate_to_budget, MemoryDocument, MemorySection};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Write contracts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Append to existing section content instead of replacing it.
    pub append: bool,
    /// Create the section when absent (subject to the section-count cap).
    pub create_if_missing: bool,
    /// Enforce the size limits. Off only for trusted internal rewrites.
    pub enforce_limits: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            append: false,
            create_if_missing: true,
            enforce_limits: true,
        }
    }
}

/// Result of one section write. `success == false` carries the reason and
/// the measured sizes; the on-disk document is untouched in that case.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub success: bool,
    pub section: String,
    pub truncated: bool,
    pub error: Option<String>,
    pub size_used: Option<usize>,
    pub size_limit: Option<usize>,
}

impl WriteOutcome {
    fn ok(section: &str, truncated: bool, size_used: usize, size_limit: usize) -> Self {
        Self {
            success: true,
            section: section.to_owned(),
            truncated,
            error: None,
            size_used: Some(size_used),
            size_limit: Some(size_limit),
        }
    }

    fn failed(section: &str, error: String) -> Self {
        Self {
            success: false,
            section: section.to_owned(),
            truncated: false,
            error: Some(error),
            size_used: None,
            size_limit: None,
        }
    }
}

/// One entry of a batched memory flush.
#[derive(Debug, Clone)]
pub struct MemoryUpdate {
    pub section: String,
    pub content: String,
    pub append: bool,
}

/// Either one section's content or the whole raw document.
#[derive(Debug, Clone)]
pub struct MemoryReadout {
    pub content: String,
    pub section_titles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub version: u64,
    pub total_size: usize,
    pub total_limit: usize,
    pub section_count: usize,
    pub max_sections: usize,
    /// `(title, content chars)` per section.
    pub sections: Vec<(String, usize)>,
}

impl MemoryStats {
    pub fn within_limits(&self) -> bool {
        self.total_size <= self.total_limit && self.section_count <= self.max_sections
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryStore {
    limits: MemoryConfig,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryStore {
    pub fn new(limits: MemoryConfig) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &MemoryConfig {
        &self.limits
    }

    fn memory_path(agent_path: &Path) -> PathBuf {
        agent_path.join("MEMORY.md")
    }

    /// Parse the existing document, `None` if absent.
    pub fn load(&self, agent_path: &Path) -> Result<Option<MemoryDocument>> {
        let path = Self::memory_path(agent_path);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(MemoryDocument::parse(&raw, &agent_dir_name(agent_path))))
    }

    /// Load the document, creating the seed document on first use.
    pub fn load_or_create(&self, agent_path: &Path, agent_id: &str) -> Result<MemoryDocument> {
        if let Some(doc) = self.load(agent_path)? {
            return Ok(doc);
        }
        let doc = MemoryDocument::seed(agent_id);
        self.save_unversioned(agent_path, &doc)?;
        Ok(doc)
    }

    /// Write one section, honoring the limits. Returns the write report;
    /// limit violations are reported, not raised.
    pub fn write_section(
        &self,
        agent_path: &Path,
        title: &str,
        content: &str,
        options: WriteOptions,
    ) -> Result<WriteOutcome> {
        let _guard = FileLockGuard::acquire(agent_path)?;
        let mut doc = self.load_or_create(agent_path, &agent_dir_name(agent_path))?;

        let outcome = self.apply_to_document(&mut doc, title, content, options);
        if outcome.success {
            self.save(agent_path, &mut doc)?;
        }
        Ok(outcome)
    }

    /// Apply a batch of updates with a single save (one version bump).
    /// Updates that would breach a limit are skipped and reported; the
    /// rest still land.
    pub fn apply_updates(
        &self,
        agent_path: &Path,
        updates: &[MemoryUpdate],
    ) -> Result<Vec<WriteOutcome>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = FileLockGuard::acquire(agent_path)?;
        let mut doc = self.load_or_create(agent_path, &agent_dir_name(agent_path))?;

        let mut outcomes = Vec::with_capacity(updates.len());
        let mut any_applied = false;
        for update in updates {
            let outcome = self.apply_to_document(
                &mut doc,
                &update.section,
                &update.content,
                WriteOptions {
                    append: update.append,
                    ..Default::default()
                },
            );
            any_applied |= outcome.success;
            outcomes.push(outcome);
        }

        if any_applied {
            self.save(agent_path, &mut doc)?;
        }
        Ok(outcomes)
    }

    /// Read one section's content, or the entire raw document when no title
    /// is given. Always reports the section titles.
    pub fn read_section(&self, agent_path: &Path, title: Option<&str>) -> Result<MemoryReadout> {
        let doc = self
            .load(agent_path)?
            .ok_or_else(|| Error::Other(format!("no memory at {}", agent_path.display())))?;

        let content = match title {
            Some(title) => doc
                .section(title)
                .map(|s| s.content.clone())
                .ok_or_else(|| Error::InvalidInput(format!("no memory section '{title}'")))?,
            None => doc.serialize(),
        };
        Ok(MemoryReadout {
            content,
            section_titles: doc.section_titles(),
        })
    }

    /// Derived metrics for observability and the loop's flush decision.
    pub fn stats(&self, agent_path: &Path) -> Result<Option<MemoryStats>> {
        Ok(self.load(agent_path)?.map(|doc| self.stats_for(&doc)))
    }

    pub fn stats_for(&self, doc: &MemoryDocument) -> MemoryStats {
        MemoryStats {
            version: doc.frontmatter.version,
            total_size: doc.total_size(),
            total_limit: self.limits.total_limit,
            section_count: doc.sections.len(),
            max_sections: self.limits.max_sections,
            sections: doc
                .sections
                .iter()
                .map(|s| (s.title.clone(), s.content.chars().count()))
                .collect(),
        }
    }

    // ── internals ───────────────────────────────────────────────────

    /// Mutate the in-memory document per the write contract. Does not save.
    fn apply_to_document(
        &self,
        doc: &mut MemoryDocument,
        title: &str,
        content: &str,
        options: WriteOptions,
    ) -> WriteOutcome {
        // Resolve or create the target section.
        if doc.section(title).is_none() {
            if !options.create_if_missing {
                return WriteOutcome::failed(title, format!("section '{title}' not found"));
            }
            if doc.sections.len() >= self.limits.max_sections {
                return WriteOutcome::failed(
                    title,
                    format!("section limit reached ({})", self.limits.max_sections),
                );
            }
            doc.sections.push(MemorySection {
                title: title.to_owned(),
                content: String::new(),
                level: 2,
            });
        }

        let section = doc.section_mut(title).expect("section exists");
        let canonical_title = section.title.clone();

        let mut new_content = if options.append && !section.content.is_empty() {
            format!("{}\n{content}", section.content)
        } else {
            content.to_owned()
        };

        let mut truncated = false;
        if options.enforce_limits {
            let (cut, was_cut) = truncate_to_budget(&new_content, self.limits.section_limit);
            new_content = cut;
            truncated = was_cut;
        }

        let previous = std::mem::replace(&mut section.content, new_content);

        let size_used = doc.total_size();
        if options.enforce_limits && size_used > self.limits.total_limit {
            // Roll the section back; the caller sees the measured overage.
            doc.section_mut(title).expect("section exists").content = previous;
            return WriteOutcome {
                success: false,
                section: canonical_title,
                truncated: false,
                error: Some(format!(
                    "total memory limit exceeded: {size_used} > {}",
                    self.limits.total_limit
                )),
                size_used: Some(size_used),
                size_limit: Some(self.limits.total_limit),
            };
        }

        WriteOutcome::ok(&canonical_title, truncated, size_used, self.limits.total_limit)
    }

    /// Bump version, stamp the date, and atomically replace the file.
    fn save(&self, agent_path: &Path, doc: &mut MemoryDocument) -> Result<()> {
        doc.frontmatter.version += 1;
        doc.frontmatter.updated = Utc::now().format("%Y-%m-%d").to_string();
        self.save_unversioned(agent_path, doc)?;

        TraceEvent::MemorySaved {
            agent_id: doc.frontmatter.agent.clone(),
            version: doc.frontmatter.version,
            total_size: doc.total_size(),
        }
        .emit();
        Ok(())
    }

    fn save_unversioned(&self, agent_path: &Path, doc: &MemoryDocument) -> Result<()> {
        std::fs::create_dir_all(agent_path)?;
        let path = Self::memory_path(agent_path);
        let tmp = agent_path.join("MEMORY.md.tmp");
        std::fs::write(&tmp, doc.serialize())?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn agent_dir_name(agent_path: &Path) -> String {
    agent_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "agent".into())
}

/// Short advisory lock held for the duration of one read-modify-write.
struct FileLockGuard {
    file: std::fs::File,
}

impl FileLockGuard {
    fn acquire(agent_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(agent_path)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(agent_path.join(".memory.lock"))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::default()
    }

    #[test]
    fn load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store().load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn load_or_create_seeds_standard_sections() {
        let dir = tempfile::tempdir().unwrap();
        let doc = store().load_or_create(dir.path(), "a1").unwrap();
        assert_eq!(doc.sections.len(), 5);
        assert!(dir.path().join("MEMORY.md").exists());

        // A second load sees the persisted seed.
        let again = store().load(dir.path()).unwrap().unwrap();
        assert_eq!(again.section_titles(), doc.section_titles());
    }

    #[test]
    fn write_section_bumps_version_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let s = store();
        s.load_or_create(dir.path(), "a1").unwrap();

        let before = s.load(dir.path()).unwrap().unwrap().frontmatter.version;
        let outcome = s
            .write_section(dir.path(), "Key Context", "vault is warm", WriteOptions::default())
            .unwrap();
        assert!(outcome.success);
        assert!(!outcome.truncated);

        let doc = s.load(dir.path()).unwrap().unwrap();
        assert_eq!(doc.section("Key Context").unwrap().content, "vault is warm");
        assert_eq!(doc.frontmatter.version, before + 1);
    }

    #[test]
    fn append_joins_with_newline() {
        let dir = tempfile::tempdir().unwrap();
        let s = store();
        s.write_section(dir.path(), "Notes", "first", WriteOptions::default())
            .unwrap();
        s.write_section(
            dir.path(),
            "Notes",
            "second",
            WriteOptions {
                append: true,
                ..Default::default()
            },
        )
        .unwrap();

        let doc = s.load(dir.path()).unwrap().unwrap();
        assert_eq!(doc.section("Notes").unwrap().content, "first\nsecond");
    }

    #[test]
    fn missing_section_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let s = store();
        s.load_or_create(dir.path(), "a1").unwrap();

        let outcome = s
            .write_section(
                dir.path(),
                "Nowhere",
                "x",
                WriteOptions {
                    create_if_missing: false,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not found"));
    }

    #[test]
    fn section_count_cap_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let s = MemoryStore::new(MemoryConfig {
            max_sections: 6,
            ..Default::default()
        });
        s.load_or_create(dir.path(), "a1").unwrap();

        // Seed has 5; one more fits, the next does not.
        assert!(s
            .write_section(dir.path(), "Sixth", "x", WriteOptions::default())
            .unwrap()
            .success);
        let outcome = s
            .write_section(dir.path(), "Seventh", "x", WriteOptions::default())
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("section limit"));
    }

    #[test]
    fn oversized_section_content_is_truncated_at_newline() {
        let dir = tempfile::tempdir().unwrap();
        let s = MemoryStore::new(MemoryConfig {
            section_limit: 100,
            ..Default::default()
        });
        let content = format!("{}\n{}", "a".repeat(70), "b".repeat(60));
        let outcome = s
            .write_section(dir.path(), "Notes", &content, WriteOptions::default())
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.truncated);

        let doc = s.load(dir.path()).unwrap().unwrap();
        assert_eq!(doc.section("Notes").unwrap().content, "a".repeat(70));
    }

    #[test]
    fn content_at_exactly_the_section_limit_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let s = MemoryStore::new(MemoryConfig {
            section_limit: 100,
            ..Default::default()
        });
        let content = "z".repeat(100);
        let outcome = s
            .write_section(dir.path(), "Notes", &content, WriteOptions::default())
            .unwrap();
        assert!(outcome.success);
        assert!(!outcome.truncated);
        let doc = s.load(dir.path()).unwrap().unwrap();
        assert_eq!(doc.section("Notes").unwrap().content.len(), 100);
    }

    #[test]
    fn total_limit_violation_reports_overage_and_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let s = store();
        s.load_or_create(dir.path(), "a1").unwrap();

        // Pad the document to exactly 49,900 serialized characters with the
        // "Notes" section still empty, then append 500 more.
        s.write_section(dir.path(), "Notes", "", WriteOptions::default())
            .unwrap();
        s.write_section(
            dir.path(),
            "Key Context",
            "k",
            WriteOptions {
                enforce_limits: false,
                ..Default::default()
            },
        )
        .unwrap();
        let current = s.load(dir.path()).unwrap().unwrap().total_size();
        let pad = 1 + 49_900 - current;
        s.write_section(
            dir.path(),
            "Key Context",
            &"k".repeat(pad),
            WriteOptions {
                enforce_limits: false,
                ..Default::default()
            },
        )
        .unwrap();
        let doc_before = s.load(dir.path()).unwrap().unwrap();
        assert_eq!(doc_before.total_size(), 49_900);
        let version_before = doc_before.frontmatter.version;

        let outcome = s
            .write_section(
                dir.path(),
                "Notes",
                &"n".repeat(500),
                WriteOptions {
                    append: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.size_used, Some(50_400));
        assert_eq!(outcome.size_limit, Some(50_000));
        assert!(outcome.error.unwrap().contains("total memory limit"));

        // On-disk document and version are unchanged.
        let doc_after = s.load(dir.path()).unwrap().unwrap();
        assert_eq!(doc_after.total_size(), 49_900);
        assert_eq!(doc_after.frontmatter.version, version_before);
        assert!(doc_after.section("Notes").unwrap().content.is_empty());
    }

    #[test]
    fn batched_updates_bump_version_once() {
        let dir = tempfile::tempdir().unwrap();
        let s = store();
        s.load_or_create(dir.path(), "a1").unwrap();
        let before = s.load(dir.path()).unwrap().unwrap().frontmatter.version;

        let outcomes = s
            .apply_updates(
                dir.path(),
                &[
                    MemoryUpdate {
                        section: "Current State".into(),
                        content: "running".into(),
                        append: false,
                    },
                    MemoryUpdate {
                        section: "Fresh Section".into(),
                        content: "created".into(),
                        append: false,
                    },
                ],
            )
            .unwrap();
        assert!(outcomes.iter().all(|o| o.success));

        let doc = s.load(dir.path()).unwrap().unwrap();
        assert_eq!(doc.frontmatter.version, before + 1);
        assert_eq!(doc.section("Fresh Section").unwrap().content, "created");
    }

    #[test]
    fn read_section_by_title_and_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let s = store();
        s.write_section(dir.path(), "Notes", "alpha", WriteOptions::default())
            .unwrap();

        let one = s.read_section(dir.path(), Some("notes")).unwrap();
        assert_eq!(one.content, "alpha");
        assert!(one.section_titles.iter().any(|t| t == "Notes"));

        let all = s.read_section(dir.path(), None).unwrap();
        assert!(all.content.starts_with("---\n"));
        assert!(all.content.contains("# Notes"));
    }

    #[test]
    fn stats_reflect_sections() {
        let dir = tempfile::tempdir().unwrap();
        let s = store();
        s.write_section(dir.path(), "Notes", "12345", WriteOptions::default())
            .unwrap();

        let stats = s.stats(dir.path()).unwrap().unwrap();
        assert!(stats.within_limits());
        assert_eq!(stats.total_limit, 50_000);
        assert!(stats.sections.iter().any(|(t, n)| t == "Notes" && *n == 5));
    }
}
