//! Permission rules and last-match-wins evaluation.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Outcome of evaluating a permission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Ask,
    Deny,
}

impl std::str::FromStr for Effect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(Self::Allow),
            "ask" => Ok(Self::Ask),
            "deny" => Ok(Self::Deny),
            other => bail!("unknown permission effect: {other}"),
        }
    }
}

/// A tool-type pattern and a path/command pattern mapped to an effect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Tool permission type, e.g. `read`, `edit`, `bash`; wildcards allowed
    pub permission: String,
    /// Glob over the call's derived pattern (file path, command, ...)
    pub pattern: String,
    #[serde(alias = "action")]
    pub effect: Effect,
}

impl PermissionRule {
    #[must_use]
    pub fn new(permission: impl Into<String>, pattern: impl Into<String>, effect: Effect) -> Self {
        Self {
            permission: permission.into(),
            pattern: pattern.into(),
            effect,
        }
    }

    #[must_use]
    pub fn allow(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, Effect::Allow)
    }

    #[must_use]
    pub fn deny(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, Effect::Deny)
    }

    #[must_use]
    pub fn ask(permission: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(permission, pattern, Effect::Ask)
    }

    #[must_use]
    pub fn matches(&self, permission: &str, pattern: &str) -> bool {
        wildcard_match(permission, &self.permission) && wildcard_match(pattern, &self.pattern)
    }
}

impl std::fmt::Display for PermissionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let effect = match self.effect {
            Effect::Allow => "allow",
            Effect::Ask => "ask",
            Effect::Deny => "deny",
        };
        write!(f, "{} {} -> {effect}", self.permission, self.pattern)
    }
}

/// Ordered list of rules. Later rules take precedence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ruleset(Vec<PermissionRule>);

impl Ruleset {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Concatenate rulesets in precedence order (agent defaults, user
    /// configuration, remembered approvals).
    #[must_use]
    pub fn merge(sources: &[&Self]) -> Self {
        Self(sources.iter().flat_map(|r| r.0.iter().cloned()).collect())
    }

    pub fn push(&mut self, rule: PermissionRule) {
        self.0.push(rule);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionRule> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, rule: &PermissionRule) -> bool {
        self.0.contains(rule)
    }

    /// Last rule matching both the permission and the pattern.
    #[must_use]
    pub fn matching_rule(&self, permission: &str, pattern: &str) -> Option<&PermissionRule> {
        self.0.iter().rev().find(|r| r.matches(permission, pattern))
    }

    /// Effect of the last matching rule; `Ask` when nothing matches.
    #[must_use]
    pub fn evaluate(&self, permission: &str, pattern: &str) -> Effect {
        self.matching_rule(permission, pattern)
            .map_or(Effect::Ask, |r| r.effect)
    }

    /// Rules whose permission matches, rendered for error messages.
    #[must_use]
    pub fn describe_for(&self, permission: &str) -> String {
        let rules: Vec<String> = self
            .0
            .iter()
            .filter(|r| wildcard_match(permission, &r.permission))
            .map(ToString::to_string)
            .collect();
        format!("[{}]", rules.join(", "))
    }

    /// Tools whose last matching rule denies every pattern. `tools` yields
    /// `(tool name, permission type)` pairs.
    #[must_use]
    pub fn disabled_tools<'a>(
        &self,
        tools: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> HashSet<String> {
        tools
            .into_iter()
            .filter(|(_, permission)| {
                self.0
                    .iter()
                    .rev()
                    .find(|r| wildcard_match(permission, &r.permission))
                    .is_some_and(|r| r.pattern == "*" && r.effect == Effect::Deny)
            })
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// Parse rules from configuration.
    ///
    /// Accepted shapes:
    /// - `"allow"`: one catch-all rule
    /// - `{"bash": "ask"}`: one rule per permission with pattern `*`
    /// - `{"edit": {"src/**": "allow", "~/secrets/*": "deny"}}`: one rule per pattern
    ///
    /// Patterns beginning with `~` or `$HOME` are expanded to the home directory.
    ///
    /// # Errors
    /// Returns an error for unknown effects or unsupported shapes.
    pub fn from_config(config: &Value) -> Result<Self> {
        let mut rules = Self::new();
        match config {
            Value::String(effect) => {
                rules.push(PermissionRule::new("*", "*", effect.parse()?));
            }
            Value::Object(map) => {
                for (permission, value) in map {
                    match value {
                        Value::String(effect) => {
                            let effect = effect
                                .parse()
                                .with_context(|| format!("permission `{permission}`"))?;
                            rules.push(PermissionRule::new(permission.clone(), "*", effect));
                        }
                        Value::Object(patterns) => {
                            for (pattern, effect) in patterns {
                                let effect = effect
                                    .as_str()
                                    .context("pattern effect must be a string")?
                                    .parse()
                                    .with_context(|| format!("permission `{permission}`"))?;
                                rules.push(PermissionRule::new(
                                    permission.clone(),
                                    expand_home(pattern),
                                    effect,
                                ));
                            }
                        }
                        other => bail!("unsupported value for permission `{permission}`: {other}"),
                    }
                }
            }
            other => bail!("unsupported permission config: {other}"),
        }
        Ok(rules)
    }
}

impl FromIterator<PermissionRule> for Ruleset {
    fn from_iter<I: IntoIterator<Item = PermissionRule>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<PermissionRule> for Ruleset {
    fn extend<I: IntoIterator<Item = PermissionRule>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

/// Glob-style match where `*` also crosses path separators.
#[must_use]
pub fn wildcard_match(value: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    glob::Pattern::new(pattern).map_or(value == pattern, |p| p.matches(value))
}

/// Expand `~`, `~/...`, `$HOME` and `$HOME/...` to the home directory.
#[must_use]
pub fn expand_home(pattern: &str) -> String {
    let Some(home) = dirs::home_dir() else {
        return pattern.to_string();
    };
    let home = home.to_string_lossy();

    if pattern == "~" {
        return home.into_owned();
    }
    if let Some(rest) = pattern.strip_prefix("~/") {
        return format!("{home}/{rest}");
    }
    if let Some(rest) = pattern.strip_prefix("$HOME") {
        return format!("{home}{rest}");
    }
    pattern.to_string()
}
