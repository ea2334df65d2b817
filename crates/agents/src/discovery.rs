//! Vault agent discovery.
//!
//! Agents are directories under the vault containing an `AGENT.md`. A
//! reference can be a direct path to such a directory or an agent id/name
//! to search for.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use va_domain::error::{Error, Result};

use crate::definition::AgentDefinition;

/// Walk depth cap; agents live near the top of the vault.
const MAX_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct DiscoveredAgent {
    /// The agent's directory (parent of `AGENT.md`).
    pub path: PathBuf,
    pub definition: AgentDefinition,
}

/// Find every parseable agent under the vault, sorted by id for stable
/// listings.
pub fn discover_agents(vault_path: &Path) -> Result<Vec<DiscoveredAgent>> {
    let mut agents = Vec::new();
    for entry in WalkDir::new(vault_path)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() && entry.file_name() == "AGENT.md" {
            let raw = match std::fs::read_to_string(entry.path()) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "unreadable AGENT.md");
                    continue;
                }
            };
            let definition = AgentDefinition::parse(&raw);
            let Some(dir) = entry.path().parent() else {
                continue;
            };
            agents.push(DiscoveredAgent {
                path: dir.to_path_buf(),
                definition,
            });
        }
    }
    agents.sort_by(|a, b| a.definition.id.cmp(&b.definition.id));
    Ok(agents)
}

/// Resolve an agent by directory path or by id/name lookup under the vault.
pub fn resolve_agent(vault_path: &Path, agent_ref: &str) -> Result<DiscoveredAgent> {
    // Direct path first: absolute, or relative to the vault.
    for candidate in [PathBuf::from(agent_ref), vault_path.join(agent_ref)] {
        let descriptor = candidate.join("AGENT.md");
        if descriptor.is_file() {
            let raw = std::fs::read_to_string(&descriptor)?;
            return Ok(DiscoveredAgent {
                path: candidate,
                definition: AgentDefinition::parse(&raw),
            });
        }
    }

    // Otherwise search by id, then by name.
    let agents = discover_agents(vault_path)?;
    agents
        .iter()
        .find(|a| a.definition.id == agent_ref)
        .or_else(|| {
            agents
                .iter()
                .find(|a| a.definition.name.eq_ignore_ascii_case(agent_ref))
        })
        .cloned()
        .ok_or_else(|| Error::AgentNotFound(agent_ref.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_agent(vault: &Path, dir: &str, id: &str, name: &str) {
        let agent_dir = vault.join(dir);
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            agent_dir.join("AGENT.md"),
            format!("---\nid: {id}\nname: {name}\ntype: project\n---\n\nDo the work.\n"),
        )
        .unwrap();
    }

    #[test]
    fn discovers_all_agents_sorted() {
        let vault = tempfile::tempdir().unwrap();
        write_agent(vault.path(), "agents/zeta", "agent_zeta", "Zeta");
        write_agent(vault.path(), "agents/alpha", "agent_alpha", "Alpha");

        let agents = discover_agents(vault.path()).unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].definition.id, "agent_alpha");
        assert_eq!(agents[1].definition.id, "agent_zeta");
    }

    #[test]
    fn resolve_by_relative_path() {
        let vault = tempfile::tempdir().unwrap();
        write_agent(vault.path(), "agents/ops", "agent_ops", "Ops");

        let agent = resolve_agent(vault.path(), "agents/ops").unwrap();
        assert_eq!(agent.definition.id, "agent_ops");
        assert!(agent.path.ends_with("agents/ops"));
    }

    #[test]
    fn resolve_by_id_and_name() {
        let vault = tempfile::tempdir().unwrap();
        write_agent(vault.path(), "agents/ops", "agent_ops", "Ops");

        assert_eq!(
            resolve_agent(vault.path(), "agent_ops").unwrap().definition.name,
            "Ops"
        );
        assert_eq!(
            resolve_agent(vault.path(), "ops").unwrap().definition.id,
            "agent_ops"
        );
    }

    #[test]
    fn unknown_agent_is_a_precise_error() {
        let vault = tempfile::tempdir().unwrap();
        let err = resolve_agent(vault.path(), "ghost").unwrap_err();
        assert!(matches!(err, Error::AgentNotFound(_)));
        assert!(err.to_string().contains("ghost"));
    }
}
