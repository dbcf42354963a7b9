//! Agent manifests and the sub-agent graph validator.
//!
//! An [`AgentManifest`] is the immutable declarative description of one
//! agent: its identity, instructions, provider, tools, sub-agents, event
//! filter and timeout. A run is handed a set of manifests plus a root id;
//! [`ManifestMap::validate`] checks the set before any work happens, since
//! a cyclic graph would recurse unboundedly during sub-agent dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::hook::RunHooks;
use crate::id::AgentId;
use crate::provider::LanguageModel;
use crate::tool::Tool;

/// Reference from a manifest to one of its sub-agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAgentRef {
    /// Manifest id of the sub-agent.
    pub manifest_id: AgentId,
    /// Exact version the reference binds to.
    pub manifest_version: String,
    /// Synthesized tool name under which the sub-agent is invocable.
    pub name: String,
    /// Description surfaced to the model for the synthesized tool.
    pub description: String,
}

/// Immutable description of one agent.
#[derive(Clone)]
pub struct AgentManifest {
    /// User-assigned id.
    pub id: AgentId,
    /// Version string; one version per id within a run configuration.
    pub version: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// System prompt.
    pub instructions: String,
    /// The model to drive.
    pub provider: Arc<dyn LanguageModel>,
    /// Tools exposed to the model.
    pub tools: Vec<Tool>,
    /// Sub-agents invocable as tools.
    pub sub_agents: Vec<SubAgentRef>,
    /// Filter for filterable event kinds; empty emits none of them.
    pub streaming_events: HashSet<EventKind>,
    /// Active-execution budget override for runs of this agent.
    pub timeout: Option<Duration>,
    /// JSON schema the final output must satisfy.
    pub output_schema: Option<Value>,
    /// Lifecycle observer.
    pub hooks: Option<Arc<dyn RunHooks>>,
}

impl std::fmt::Debug for AgentManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManifest")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("name", &self.name)
            .field("tools", &self.tools.len())
            .field("sub_agents", &self.sub_agents.len())
            .finish_non_exhaustive()
    }
}

impl AgentManifest {
    /// Start building a manifest.
    #[must_use]
    pub fn builder(
        id: impl Into<AgentId>,
        version: impl Into<String>,
        provider: Arc<dyn LanguageModel>,
    ) -> ManifestBuilder {
        ManifestBuilder {
            manifest: Self {
                id: id.into(),
                version: version.into(),
                name: String::new(),
                description: String::new(),
                instructions: String::new(),
                provider,
                tools: Vec::new(),
                sub_agents: Vec::new(),
                streaming_events: HashSet::new(),
                timeout: None,
                output_schema: None,
                hooks: None,
            },
        }
    }

    /// The active-execution budget for runs of this agent.
    #[must_use]
    pub fn effective_timeout(&self, config: &RuntimeConfig) -> Duration {
        self.timeout.unwrap_or(config.agent_timeout)
    }

    /// Find the sub-agent reference carrying the given synthesized tool
    /// name.
    #[must_use]
    pub fn sub_agent_by_name(&self, name: &str) -> Option<&SubAgentRef> {
        self.sub_agents.iter().find(|r| r.name == name)
    }

    /// Find the sub-agent reference targeting the given manifest id.
    #[must_use]
    pub fn sub_agent_by_id(&self, manifest_id: &AgentId) -> Option<&SubAgentRef> {
        self.sub_agents.iter().find(|r| &r.manifest_id == manifest_id)
    }
}

/// Builder for [`AgentManifest`].
#[derive(Debug)]
pub struct ManifestBuilder {
    manifest: AgentManifest,
}

impl ManifestBuilder {
    /// Set the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.manifest.name = name.into();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.manifest.description = description.into();
        self
    }

    /// Set the system prompt.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.manifest.instructions = instructions.into();
        self
    }

    /// Add a tool.
    #[must_use]
    pub fn tool(mut self, tool: Tool) -> Self {
        self.manifest.tools.push(tool);
        self
    }

    /// Add a sub-agent reference.
    #[must_use]
    pub fn sub_agent(mut self, reference: SubAgentRef) -> Self {
        self.manifest.sub_agents.push(reference);
        self
    }

    /// Allow the given filterable event kinds through the stream.
    #[must_use]
    pub fn streaming_events(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.manifest.streaming_events = kinds.into_iter().collect();
        self
    }

    /// Override the active-execution budget.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.manifest.timeout = Some(timeout);
        self
    }

    /// Require the final output to satisfy a JSON schema.
    #[must_use]
    pub fn output_schema(mut self, schema: Value) -> Self {
        self.manifest.output_schema = Some(schema);
        self
    }

    /// Attach lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.manifest.hooks = Some(hooks);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> AgentManifest {
        self.manifest
    }
}

/// A validated set of manifests for one run.
#[derive(Debug, Clone)]
pub struct ManifestMap {
    manifests: HashMap<AgentId, Arc<AgentManifest>>,
    root: AgentId,
}

impl ManifestMap {
    /// Validate a manifest set against a root id.
    ///
    /// Rules, in order, first failure aborts:
    /// 1. the root must be present;
    /// 2. no two manifests share an `(id, version)` pair;
    /// 3. no id carries more than one version;
    /// 4. every sub-agent reference resolves to a present `(id, version)`;
    /// 5. the sub-agent graph is acyclic.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` naming the offending manifest(s).
    pub fn validate(manifests: Vec<AgentManifest>, root: AgentId) -> Result<Self> {
        if !manifests.iter().any(|m| m.id == root) {
            return Err(Error::bad_request(format!(
                "root manifest not found: {root}"
            ))
            .with_metadata("manifest_id", root.as_str()));
        }

        let mut seen_pairs: HashSet<(AgentId, String)> = HashSet::new();
        for manifest in &manifests {
            let pair = (manifest.id.clone(), manifest.version.clone());
            if !seen_pairs.insert(pair) {
                return Err(Error::bad_request(format!(
                    "duplicate manifest {}:{}",
                    manifest.id, manifest.version
                ))
                .with_metadata("manifest_id", manifest.id.as_str())
                .with_metadata("manifest_version", manifest.version.clone()));
            }
        }

        let mut versions: HashMap<&AgentId, &str> = HashMap::new();
        for manifest in &manifests {
            if let Some(existing) = versions.insert(&manifest.id, &manifest.version)
                && existing != manifest.version
            {
                return Err(Error::bad_request(format!(
                    "manifest {} appears with conflicting versions {existing} and {}",
                    manifest.id, manifest.version
                ))
                .with_metadata("manifest_id", manifest.id.as_str()));
            }
        }

        for manifest in &manifests {
            for reference in &manifest.sub_agents {
                let resolves = manifests.iter().any(|m| {
                    m.id == reference.manifest_id && m.version == reference.manifest_version
                });
                if !resolves {
                    return Err(Error::bad_request(format!(
                        "sub-agent reference {}:{} from {} does not resolve",
                        reference.manifest_id, reference.manifest_version, manifest.id
                    ))
                    .with_metadata("manifest_id", manifest.id.as_str())
                    .with_metadata("reference", reference.manifest_id.as_str()));
                }
            }
        }

        let by_id: HashMap<AgentId, &AgentManifest> =
            manifests.iter().map(|m| (m.id.clone(), m)).collect();
        let mut visited: HashSet<AgentId> = HashSet::new();
        let mut on_stack: HashSet<AgentId> = HashSet::new();
        for manifest in &manifests {
            detect_cycle(&manifest.id, &by_id, &mut visited, &mut on_stack)?;
        }

        Ok(Self {
            manifests: manifests
                .into_iter()
                .map(|m| (m.id.clone(), Arc::new(m)))
                .collect(),
            root,
        })
    }

    /// The root manifest.
    #[must_use]
    pub fn root(&self) -> &Arc<AgentManifest> {
        // Presence of the root is checked by `validate`.
        &self.manifests[&self.root]
    }

    /// The root manifest id.
    #[must_use]
    pub const fn root_id(&self) -> &AgentId {
        &self.root
    }

    /// Look up a manifest by id.
    #[must_use]
    pub fn get(&self, id: &AgentId) -> Option<&Arc<AgentManifest>> {
        self.manifests.get(id)
    }

    /// Look up a manifest by id, failing with `NotFound`.
    pub fn require(&self, id: &AgentId) -> Result<&Arc<AgentManifest>> {
        self.get(id).ok_or_else(|| {
            Error::not_found(format!("manifest not found: {id}"))
                .with_metadata("manifest_id", id.as_str())
        })
    }
}

/// DFS with an on-stack set; reports the offending key.
fn detect_cycle(
    id: &AgentId,
    by_id: &HashMap<AgentId, &AgentManifest>,
    visited: &mut HashSet<AgentId>,
    on_stack: &mut HashSet<AgentId>,
) -> Result<()> {
    if visited.contains(id) {
        return Ok(());
    }
    if !on_stack.insert(id.clone()) {
        return Err(Error::bad_request(format!(
            "circular sub-agent reference involving {id}"
        ))
        .with_metadata("manifest_id", id.as_str()));
    }
    if let Some(manifest) = by_id.get(id) {
        for reference in &manifest.sub_agents {
            if on_stack.contains(&reference.manifest_id) {
                return Err(Error::bad_request(format!(
                    "circular sub-agent reference involving {}",
                    reference.manifest_id
                ))
                .with_metadata("manifest_id", reference.manifest_id.as_str()));
            }
            detect_cycle(&reference.manifest_id, by_id, visited, on_stack)?;
        }
    }
    on_stack.remove(id);
    visited.insert(id.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::provider::mock::MockProvider;

    fn provider() -> Arc<dyn LanguageModel> {
        Arc::new(MockProvider::new(Vec::new()))
    }

    fn manifest(id: &str, version: &str) -> AgentManifest {
        AgentManifest::builder(id, version, provider())
            .name(id)
            .build()
    }

    fn with_sub(mut manifest: AgentManifest, target: &str, version: &str) -> AgentManifest {
        manifest.sub_agents.push(SubAgentRef {
            manifest_id: AgentId::new(target),
            manifest_version: version.to_owned(),
            name: format!("sub_agent_{target}"),
            description: String::new(),
        });
        manifest
    }

    #[test]
    fn valid_tree_passes() {
        let root = with_sub(manifest("root", "1.0.0"), "child", "1.0.0");
        let child = manifest("child", "1.0.0");
        let map = ManifestMap::validate(vec![root, child], AgentId::new("root")).unwrap();
        assert_eq!(map.root_id(), &AgentId::new("root"));
        assert!(map.get(&AgentId::new("child")).is_some());
    }

    #[test]
    fn missing_root_is_rejected() {
        let err = ManifestMap::validate(vec![manifest("a", "1.0.0")], AgentId::new("root"))
            .unwrap_err();
        assert!(err.is(ErrorCode::BadRequest));
        assert_eq!(
            err.metadata().get("manifest_id"),
            Some(&serde_json::Value::String("root".to_owned()))
        );
    }

    #[test]
    fn duplicate_id_version_pair_is_rejected() {
        let err = ManifestMap::validate(
            vec![manifest("root", "1.0.0"), manifest("root", "1.0.0")],
            AgentId::new("root"),
        )
        .unwrap_err();
        assert!(err.is(ErrorCode::BadRequest));
        assert!(err.message().contains("duplicate"));
    }

    #[test]
    fn conflicting_versions_for_one_id_are_rejected() {
        let err = ManifestMap::validate(
            vec![manifest("root", "1.0.0"), manifest("root", "2.0.0")],
            AgentId::new("root"),
        )
        .unwrap_err();
        assert!(err.is(ErrorCode::BadRequest));
        assert!(err.message().contains("conflicting versions"));
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let root = with_sub(manifest("root", "1.0.0"), "ghost", "1.0.0");
        let err = ManifestMap::validate(vec![root], AgentId::new("root")).unwrap_err();
        assert!(err.is(ErrorCode::BadRequest));
        assert!(err.message().contains("does not resolve"));
    }

    #[test]
    fn version_mismatch_in_reference_is_rejected() {
        let root = with_sub(manifest("root", "1.0.0"), "child", "2.0.0");
        let child = manifest("child", "1.0.0");
        let err = ManifestMap::validate(vec![root, child], AgentId::new("root")).unwrap_err();
        assert!(err.is(ErrorCode::BadRequest));
    }

    #[test]
    fn direct_cycle_is_rejected() {
        let a = with_sub(manifest("a", "1.0.0"), "b", "1.0.0");
        let b = with_sub(manifest("b", "1.0.0"), "a", "1.0.0");
        let err = ManifestMap::validate(vec![a, b], AgentId::new("a")).unwrap_err();
        assert!(err.is(ErrorCode::BadRequest));
        assert!(err.message().contains("circular"));
    }

    #[test]
    fn self_cycle_is_rejected() {
        let a = with_sub(manifest("a", "1.0.0"), "a", "1.0.0");
        let err = ManifestMap::validate(vec![a], AgentId::new("a")).unwrap_err();
        assert!(err.message().contains("circular"));
    }

    #[test]
    fn three_level_chain_is_acyclic() {
        let root = with_sub(manifest("root", "1.0.0"), "middle", "1.0.0");
        let middle = with_sub(manifest("middle", "1.0.0"), "leaf", "1.0.0");
        let leaf = manifest("leaf", "1.0.0");
        assert!(ManifestMap::validate(vec![root, middle, leaf], AgentId::new("root")).is_ok());
    }

    #[test]
    fn diamond_sharing_is_not_a_cycle() {
        let root = with_sub(
            with_sub(manifest("root", "1.0.0"), "left", "1.0.0"),
            "right",
            "1.0.0",
        );
        let left = with_sub(manifest("left", "1.0.0"), "shared", "1.0.0");
        let right = with_sub(manifest("right", "1.0.0"), "shared", "1.0.0");
        let shared = manifest("shared", "1.0.0");
        assert!(
            ManifestMap::validate(vec![root, left, right, shared], AgentId::new("root")).is_ok()
        );
    }

    #[test]
    fn effective_timeout_falls_back_to_config() {
        let config = RuntimeConfig::default();
        let plain = manifest("a", "1.0.0");
        assert_eq!(plain.effective_timeout(&config), config.agent_timeout);

        let tuned = AgentManifest::builder("b", "1.0.0", provider())
            .timeout(Duration::from_secs(5))
            .build();
        assert_eq!(tuned.effective_timeout(&config), Duration::from_secs(5));
    }
}
