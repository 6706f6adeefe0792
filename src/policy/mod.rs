//! Role-based tool authorization.
//!
//! A [`ToolPolicy`] maps each known [`CallerRole`] to an allow-list of tool
//! names. The [`AuthorizationFilter`] applies it to the registry and yields
//! the [`AllowedTools`] a session run may see. Anything not explicitly
//! allowed is denied; unknown roles always get nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ParleyError;
use crate::tools::{CapabilityRegistry, Tool, ToolDefinition};

/// Allow-list entry that matches every registered tool.
pub const WILDCARD: &str = "*";

/// Role of the caller, as supplied by the identity system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CallerRole {
    Admin,
    User,
    Guest,
    /// Any role string this process does not recognise.
    Unknown(String),
}

impl CallerRole {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Guest => "guest",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl From<&str> for CallerRole {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "user" => Self::User,
            "guest" => Self::Guest,
            _ => Self::Unknown(raw.to_string()),
        }
    }
}

impl From<String> for CallerRole {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<CallerRole> for String {
    fn from(role: CallerRole) -> Self {
        role.as_str().to_string()
    }
}

impl FromStr for CallerRole {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for CallerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role name to tool allow-list mapping.
///
/// Serialized as a plain table, e.g. in TOML:
///
/// ```toml
/// [policy]
/// admin = ["*"]
/// user = ["get_price"]
/// ```
/// Known role keys are stored in canonical form (`Admin` loads as `admin`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PolicyTable", into = "PolicyTable")]
pub struct ToolPolicy {
    allow: PolicyTable,
}

type PolicyTable = BTreeMap<String, BTreeSet<String>>;

impl From<PolicyTable> for ToolPolicy {
    fn from(table: PolicyTable) -> Self {
        let mut allow = PolicyTable::new();
        for (key, tools) in table {
            let role = CallerRole::from(key.as_str());
            let key = if role.is_known() { role.as_str().to_string() } else { key };
            allow.entry(key).or_default().extend(tools);
        }
        Self { allow }
    }
}

impl From<ToolPolicy> for PolicyTable {
    fn from(policy: ToolPolicy) -> Self {
        policy.allow
    }
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::empty()
            .allow(CallerRole::Admin, [WILDCARD])
            .allow(CallerRole::User, ["get_price"])
    }
}

impl ToolPolicy {
    /// A policy that denies everything.
    pub fn empty() -> Self {
        Self {
            allow: PolicyTable::new(),
        }
    }

    /// Add tool names to a role's allow-list.
    pub fn allow<I, S>(mut self, role: CallerRole, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow
            .entry(role.as_str().to_string())
            .or_default()
            .extend(tools.into_iter().map(Into::into));
        self
    }

    /// Reject entries keyed by roles this process does not recognise.
    pub fn validate(&self) -> Result<(), ParleyError> {
        match self.allow.keys().find(|k| !CallerRole::from(k.as_str()).is_known()) {
            Some(role) => Err(ParleyError::Configuration(format!(
                "tool policy names unknown role '{role}'"
            ))),
            None => Ok(()),
        }
    }

    /// Whether `role` may use the tool called `tool_name`.
    pub fn permits(&self, role: &CallerRole, tool_name: &str) -> bool {
        if !role.is_known() {
            return false;
        }
        self.allow
            .get(role.as_str())
            .is_some_and(|names| names.contains(WILDCARD) || names.contains(tool_name))
    }
}

/// The subset of registered tools visible to one session run.
#[derive(Clone, Default)]
pub struct AllowedTools {
    tools: Vec<Arc<dyn Tool>>,
}

impl AllowedTools {
    pub fn none() -> Self {
        Self::default()
    }

    /// Look up an allowed tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| ToolDefinition::of(t.as_ref())).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for AllowedTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Narrows the registry to what a role may use.
#[derive(Debug, Clone)]
pub struct AuthorizationFilter {
    registry: Arc<CapabilityRegistry>,
    policy: ToolPolicy,
}

impl AuthorizationFilter {
    pub fn new(registry: Arc<CapabilityRegistry>, policy: ToolPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    /// Tools `role` may use, in registry order. Total over all roles.
    pub fn allowed_tools(&self, role: &CallerRole) -> AllowedTools {
        let tools = self
            .registry
            .iter()
            .filter(|tool| self.policy.permits(role, tool.name()))
            .cloned()
            .collect::<Vec<_>>();
        tracing::debug!(role = %role, tools = tools.len(), "resolved allowed tools");
        AllowedTools { tools }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{AgentTool, ToolParameters};

    fn registry() -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        for name in ["get_price", "web_search", "rag_qa"] {
            registry
                .register(AgentTool::new(name, name, ToolParameters::empty(), |_, _| async {
                    Ok(String::new())
                }))
                .unwrap();
        }
        Arc::new(registry)
    }

    #[test]
    fn admin_sees_every_tool() {
        let filter = AuthorizationFilter::new(registry(), ToolPolicy::default());
        let allowed = filter.allowed_tools(&CallerRole::Admin);
        assert_eq!(allowed.names(), vec!["get_price", "web_search", "rag_qa"]);
    }

    #[test]
    fn user_sees_only_price_lookup() {
        let filter = AuthorizationFilter::new(registry(), ToolPolicy::default());
        let allowed = filter.allowed_tools(&CallerRole::User);
        assert_eq!(allowed.names(), vec!["get_price"]);
        assert!(!allowed.contains("web_search"));
    }

    #[test]
    fn guest_and_unknown_roles_fail_closed() {
        let filter = AuthorizationFilter::new(registry(), ToolPolicy::default());
        assert!(filter.allowed_tools(&CallerRole::Guest).is_empty());
        assert!(filter
            .allowed_tools(&CallerRole::Unknown("superuser".into()))
            .is_empty());
    }

    #[test]
    fn allowed_set_is_a_subset_of_the_registry() {
        let registry = registry();
        let policy = ToolPolicy::empty().allow(CallerRole::Guest, ["rag_qa", "not_registered"]);
        let filter = AuthorizationFilter::new(Arc::clone(&registry), policy);
        let allowed = filter.allowed_tools(&CallerRole::Guest);
        assert_eq!(allowed.names(), vec!["rag_qa"]);
        assert!(allowed.names().iter().all(|n| registry.contains(n)));
    }

    #[test]
    fn filter_is_deterministic() {
        let filter = AuthorizationFilter::new(registry(), ToolPolicy::default());
        let a = filter.allowed_tools(&CallerRole::User).names().join(",");
        let b = filter.allowed_tools(&CallerRole::User).names().join(",");
        assert_eq!(a, b);
    }

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!(CallerRole::from("ADMIN"), CallerRole::Admin);
        assert_eq!(
            CallerRole::from("root"),
            CallerRole::Unknown("root".to_string())
        );
        assert_eq!(CallerRole::User.to_string(), "user");
    }

    #[test]
    fn role_keys_are_canonicalised_on_load() {
        let policy: ToolPolicy = serde_json::from_value(serde_json::json!({
            "Admin": ["*"],
            "USER": ["get_price"],
            "user": ["get_news"],
        }))
        .unwrap();
        assert!(policy.validate().is_ok());
        assert!(policy.permits(&CallerRole::Admin, "web_search"));
        assert!(policy.permits(&CallerRole::User, "get_price"));
        assert!(policy.permits(&CallerRole::User, "get_news"));
        assert_eq!(
            serde_json::to_value(&policy).unwrap(),
            serde_json::json!({ "admin": ["*"], "user": ["get_news", "get_price"] })
        );
    }

    #[test]
    fn policy_validation_rejects_unknown_role_keys() {
        let policy: ToolPolicy =
            serde_json::from_value(serde_json::json!({"operator": ["get_price"]})).unwrap();
        assert!(policy.validate().is_err());
        assert!(ToolPolicy::default().validate().is_ok());
    }
}
