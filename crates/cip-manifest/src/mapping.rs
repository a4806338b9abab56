use crate::{Manifest, ManifestError, TransportKind};
use cip_core::Role;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Checking,
    Ok,
    Error,
}

/// Display-only view of which agent runs which role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentMapping {
    pub role: Role,
    pub transport: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One mapping per present role. Entries from `overrides` win over the manifest's
/// own agent strings; overrides for roles the manifest does not define are ignored.
pub fn extract_agent_mappings(
    manifest: &Manifest,
    overrides: &BTreeMap<Role, String>,
) -> Vec<AgentMapping> {
    manifest
        .present_roles()
        .into_iter()
        .filter_map(|role| {
            let raw = overrides
                .get(&role)
                .map(String::as_str)
                .or_else(|| manifest.role_agent(role))?;
            Some(match TransportKind::parse(raw) {
                Ok(kind) => AgentMapping {
                    role,
                    transport: kind.to_string(),
                    status: AgentStatus::Pending,
                    detail: None,
                },
                Err(err) => AgentMapping {
                    role,
                    transport: raw.to_string(),
                    status: AgentStatus::Error,
                    detail: Some(err.reason),
                },
            })
        })
        .collect()
}

/// Parses every present role's agent exactly once, applying `overrides` first.
pub fn resolve_agents(
    manifest: &Manifest,
    overrides: &BTreeMap<Role, String>,
) -> Result<BTreeMap<Role, TransportKind>, ManifestError> {
    let mut agents = BTreeMap::new();
    for role in manifest.present_roles() {
        let (field, raw) = match overrides.get(&role) {
            Some(raw) => (format!("agents.{}", role), raw.as_str()),
            None => (
                format!("roles.{}.agent", role),
                manifest.role_agent(role).unwrap_or_default(),
            ),
        };
        let kind = TransportKind::parse(raw)
            .map_err(|err| ManifestError::validation(field, err.to_string()))?;
        agents.insert(role, kind);
    }
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        let mut manifest = Manifest::template();
        if let Some(server) = manifest.roles.server.as_mut() {
            server.agent = "ssh://ops@plc-lab:2201".to_string();
        }
        manifest
    }

    #[test]
    fn one_mapping_per_present_role_with_reparsable_transport() {
        let manifest = manifest();
        manifest.validate().expect("valid");
        let mappings = extract_agent_mappings(&manifest, &BTreeMap::new());
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].role, Role::Server);
        assert_eq!(mappings[0].transport, "ssh://ops@plc-lab:2201");
        assert_eq!(mappings[1].role, Role::Client);
        assert_eq!(mappings[1].transport, "local");
        for mapping in &mappings {
            assert_eq!(mapping.status, AgentStatus::Pending);
            TransportKind::parse(&mapping.transport).expect("mapping transport re-parses");
        }

        let mut server_only = manifest.clone();
        server_only.roles.client = None;
        assert_eq!(extract_agent_mappings(&server_only, &BTreeMap::new()).len(), 1);
    }

    #[test]
    fn overrides_take_precedence() {
        let manifest = manifest();
        let mut overrides = BTreeMap::new();
        overrides.insert(Role::Server, "local".to_string());
        let agents = resolve_agents(&manifest, &overrides).expect("resolve");
        assert_eq!(agents.get(&Role::Server), Some(&TransportKind::Local));

        let mappings = extract_agent_mappings(&manifest, &overrides);
        assert_eq!(mappings[0].transport, "local");
    }

    #[test]
    fn invalid_override_is_reported_against_the_override() {
        let manifest = manifest();
        let mut overrides = BTreeMap::new();
        overrides.insert(Role::Client, "ftp://nope".to_string());
        match resolve_agents(&manifest, &overrides) {
            Err(ManifestError::Validation { field, .. }) => assert_eq!(field, "agents.client"),
            other => panic!("expected validation error, got {:?}", other),
        }
        let mappings = extract_agent_mappings(&manifest, &overrides);
        assert_eq!(mappings[1].status, AgentStatus::Error);
        assert!(mappings[1].detail.is_some());
    }
}
