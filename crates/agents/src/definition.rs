//! `AGENT.md` parser.
//!
//! The descriptor is one markdown file: YAML frontmatter delimited by `---`
//! lines, a free-text instructions preamble, then level-1/2 sections split
//! on leading `#`/`##`. The parser is permissive: missing frontmatter
//! yields empty metadata, missing sections yield an empty mapping, and
//! unknown frontmatter keys are preserved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Admin,
    #[default]
    Project,
    Skill,
}

/// A named conversational actor with persistent identity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub kind: AgentKind,
    /// Opaque capability descriptor, forwarded verbatim to the tool executor.
    pub scope: Option<String>,
    pub created: Option<String>,
    pub updated: Option<String>,
    pub status: Option<String>,
    /// Unrecognised frontmatter keys, preserved verbatim.
    pub extra: BTreeMap<String, serde_yaml::Value>,
    /// Free text before the first heading.
    pub instructions: String,
    /// Named sections in document order, e.g. `identity`, `capabilities`.
    pub sections: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Frontmatter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<AgentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

impl AgentDefinition {
    /// Parse a raw `AGENT.md`.
    pub fn parse(raw: &str) -> Self {
        let (frontmatter, body) = split_frontmatter(raw);
        let fm = frontmatter
            .and_then(|yaml| serde_yaml::from_str::<Frontmatter>(yaml).ok())
            .unwrap_or_default();

        let (instructions, sections) = split_sections(body);

        Self {
            id: fm.id.unwrap_or_default(),
            name: fm.name.unwrap_or_default(),
            kind: fm.kind.unwrap_or_default(),
            scope: fm.scope,
            created: fm.created,
            updated: fm.updated,
            status: fm.status,
            extra: fm.extra,
            instructions,
            sections,
        }
    }

    /// Render back to markdown. `parse(serialize(def)) == def`.
    pub fn serialize(&self) -> String {
        let fm = Frontmatter {
            id: some_nonempty(&self.id),
            name: some_nonempty(&self.name),
            kind: Some(self.kind),
            scope: self.scope.clone(),
            created: self.created.clone(),
            updated: self.updated.clone(),
            status: self.status.clone(),
            extra: self.extra.clone(),
        };
        let yaml = serde_yaml::to_string(&fm).unwrap_or_default();

        let mut out = String::new();
        out.push_str("---\n");
        out.push_str(&yaml);
        out.push_str("---\n");
        if !self.instructions.is_empty() {
            out.push('\n');
            out.push_str(&self.instructions);
            out.push('\n');
        }
        for (title, content) in &self.sections {
            out.push_str("\n## ");
            out.push_str(title);
            out.push('\n');
            if !content.is_empty() {
                out.push('\n');
                out.push_str(content);
                out.push('\n');
            }
        }
        out
    }

    /// Case-insensitive section lookup.
    pub fn section(&self, title: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(title))
            .map(|(_, c)| c.as_str())
    }
}

fn some_nonempty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let Some(rest) = raw.strip_prefix("---\n") else {
        return (None, raw);
    };
    match rest.find("\n---\n") {
        Some(end) => (Some(&rest[..end]), &rest[end + "\n---\n".len()..]),
        None => (None, raw),
    }
}

/// Split a body into the preamble (instructions) and its headed sections.
fn split_sections(body: &str) -> (String, Vec<(String, String)>) {
    let mut instructions = String::new();
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in body.lines() {
        let heading = line
            .strip_prefix("## ")
            .or_else(|| line.strip_prefix("# "));

        if let Some(title) = heading {
            if let Some((t, c)) = current.take() {
                sections.push((t, c.trim().to_owned()));
            }
            current = Some((title.trim().to_owned(), String::new()));
        } else if let Some((_, content)) = current.as_mut() {
            content.push_str(line);
            content.push('\n');
        } else {
            instructions.push_str(line);
            instructions.push('\n');
        }
    }
    if let Some((t, c)) = current.take() {
        sections.push((t, c.trim().to_owned()));
    }
    (instructions.trim().to_owned(), sections)
}
