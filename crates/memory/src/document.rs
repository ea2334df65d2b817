//! The memory document: frontmatter + headed markdown sections.
//!
//! Parsing is permissive. A document without frontmatter gets default
//! metadata; a body without headings becomes a document with no sections.
//! `parse(serialize(doc))` reproduces the document exactly.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Frontmatter of a `MEMORY.md` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFrontmatter {
    #[serde(rename = "type")]
    pub kind: String,
    pub agent: String,
    /// Date of the last save, `YYYY-MM-DD`.
    pub updated: String,
    pub version: u64,
    /// Unrecognised frontmatter keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl MemoryFrontmatter {
    pub fn new(agent: &str) -> Self {
        Self {
            kind: "agent-memory".into(),
            agent: agent.to_owned(),
            updated: Utc::now().format("%Y-%m-%d").to_string(),
            version: 1,
            extra: BTreeMap::new(),
        }
    }
}

/// One headed section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySection {
    pub title: String,
    pub content: String,
    /// Heading level, 1 or 2.
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryDocument {
    pub frontmatter: MemoryFrontmatter,
    pub sections: Vec<MemorySection>,
}

impl MemoryDocument {
    /// Seed document with the standard working-memory sections.
    pub fn seed(agent_id: &str) -> Self {
        let section = |title: &str, level: u8| MemorySection {
            title: title.to_owned(),
            content: String::new(),
            level,
        };
        Self {
            frontmatter: MemoryFrontmatter::new(agent_id),
            sections: vec![
                section("Working Memory", 1),
                section("Current State", 2),
                section("Key Context", 2),
                section("Pending Actions", 2),
                section("Important Notes", 2),
            ],
        }
    }

    /// Parse a raw `MEMORY.md`. Missing or malformed frontmatter yields
    /// default metadata for the given agent.
    pub fn parse(raw: &str, agent_id: &str) -> Self {
        let (frontmatter, body) = split_frontmatter(raw);
        let frontmatter = frontmatter
            .and_then(|yaml| serde_yaml::from_str::<MemoryFrontmatter>(yaml).ok())
            .unwrap_or_else(|| MemoryFrontmatter::new(agent_id));
        Self {
            frontmatter,
            sections: parse_sections(body),
        }
    }

    /// Render back to markdown.
    pub fn serialize(&self) -> String {
        let yaml = serde_yaml::to_string(&self.frontmatter).unwrap_or_default();
        let mut out = String::with_capacity(yaml.len() + 256);
        out.push_str("---\n");
        out.push_str(&yaml);
        out.push_str("---\n");
        for section in &self.sections {
            out.push('\n');
            for _ in 0..section.level {
                out.push('#');
            }
            out.push(' ');
            out.push_str(&section.title);
            out.push('\n');
            if !section.content.is_empty() {
                out.push('\n');
                out.push_str(&section.content);
                out.push('\n');
            }
        }
        out
    }

    /// Total content size in characters, summed across sections. This is
    /// the figure the size limits are measured against: writing N
    /// characters grows it by exactly N.
    pub fn total_size(&self) -> usize {
        self.sections.iter().map(|s| s.content.chars().count()).sum()
    }

    /// Case-insensitive section lookup.
    pub fn section(&self, title: &str) -> Option<&MemorySection> {
        self.sections
            .iter()
            .find(|s| s.title.eq_ignore_ascii_case(title))
    }

    pub fn section_mut(&mut self, title: &str) -> Option<&mut MemorySection> {
        self.sections
            .iter_mut()
            .find(|s| s.title.eq_ignore_ascii_case(title))
    }

    pub fn section_titles(&self) -> Vec<String> {
        self.sections.iter().map(|s| s.title.clone()).collect()
    }

    /// Body markdown without the frontmatter header.
    pub fn body(&self) -> String {
        let rendered = self.serialize();
        match split_frontmatter(&rendered) {
            (Some(_), body) => body.trim_start().to_owned(),
            (None, body) => body.to_owned(),
        }
    }
}

/// Split an optional `---`-delimited frontmatter block from the body.
fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let Some(rest) = raw.strip_prefix("---\n") else {
        return (None, raw);
    };
    match rest.find("\n---\n") {
        Some(end) => (Some(&rest[..end]), &rest[end + "\n---\n".len()..]),
        None => (None, raw),
    }
}

/// Split a markdown body into level-1/2 headed sections. Text before the
/// first heading is dropped (memory documents have no preamble).
fn parse_sections(body: &str) -> Vec<MemorySection> {
    let mut sections: Vec<MemorySection> = Vec::new();
    let mut current: Option<MemorySection> = None;

    for line in body.lines() {
        let heading = if let Some(title) = line.strip_prefix("## ") {
            Some((title.trim(), 2u8))
        } else {
            line.strip_prefix("# ").map(|title| (title.trim(), 1u8))
        };

        if let Some((title, level)) = heading {
            if let Some(mut section) = current.take() {
                section.content = section.content.trim().to_owned();
                sections.push(section);
            }
            current = Some(MemorySection {
                title: title.to_owned(),
                content: String::new(),
                level,
            });
        } else if let Some(section) = current.as_mut() {
            section.content.push_str(line);
            section.content.push('\n');
        }
    }
    if let Some(mut section) = current.take() {
        section.content = section.content.trim().to_owned();
        sections.push(section);
    }
    sections
}

/// Truncate `text` to fit `budget` characters: cut at the last newline
/// within 80 % of the budget, falling back to a plain character cut.
/// Returns the (possibly shortened) text and whether truncation happened.
pub fn truncate_to_budget(text: &str, budget: usize) -> (String, bool) {
    if text.chars().count() <= budget {
        return (text.to_owned(), false);
    }
    let target = budget * 8 / 10;
    let cut: String = text.chars().take(target).collect();
    match cut.rfind('\n') {
        Some(pos) => (cut[..pos].to_owned(), true),
        None => (cut, true),
    }
}
