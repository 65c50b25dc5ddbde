//! Hook configuration: lifecycle events mapped to ordered lists of
//! matcher-scoped commands, validated and merged from the user and project
//! Wave configurations.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    Notification,
}

impl HookEvent {
    pub const ALL: [HookEvent; 6] = [
        HookEvent::PreToolUse,
        HookEvent::PostToolUse,
        HookEvent::UserPromptSubmit,
        HookEvent::Stop,
        HookEvent::SubagentStop,
        HookEvent::Notification,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::Stop => "Stop",
            Self::SubagentStop => "SubagentStop",
            Self::Notification => "Notification",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.name() == name)
    }

    /// Tool events are the only ones that may carry a matcher.
    pub fn is_tool_event(&self) -> bool {
        matches!(self, Self::PreToolUse | Self::PostToolUse)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCommand {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matcher: Option<String>,
    pub hooks: Vec<HookCommand>,
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hooks configuration must be an object")]
    NotAnObject,
    #[error("unknown hook event: {0}")]
    UnknownEvent(String),
    #[error("hook event {0} must map to an array of entries")]
    NotAnArray(String),
    #[error("invalid hook entry for {event}: {detail}")]
    InvalidEntry { event: String, detail: String },
    #[error("matcher not allowed on non-tool event {0}")]
    MatcherOnNonToolEvent(String),
    #[error("unsafe hook command rejected: {0}")]
    UnsafeCommand(String),
}

#[derive(Debug, Clone, Default)]
pub struct HookConfig {
    events: HashMap<HookEvent, Vec<HookEntry>>,
}

impl HookConfig {
    /// Parse and validate the `hooks` section of a Wave configuration.
    /// Rejects unknown event names, non-array event bodies, matchers on
    /// non-tool events, and commands failing the safety predicate.
    pub fn from_value(value: &Value) -> Result<Self, HookError> {
        let object = value.as_object().ok_or(HookError::NotAnObject)?;
        let mut events = HashMap::new();
        for (name, body) in object {
            let event =
                HookEvent::from_name(name).ok_or_else(|| HookError::UnknownEvent(name.clone()))?;
            let array = body
                .as_array()
                .ok_or_else(|| HookError::NotAnArray(name.clone()))?;
            let mut entries = Vec::with_capacity(array.len());
            for raw in array {
                let entry: HookEntry = serde_json::from_value(raw.clone()).map_err(|e| {
                    HookError::InvalidEntry {
                        event: name.clone(),
                        detail: e.to_string(),
                    }
                })?;
                if entry.matcher.is_some() && !event.is_tool_event() {
                    return Err(HookError::MatcherOnNonToolEvent(name.clone()));
                }
                for hook in &entry.hooks {
                    if !is_command_safe(&hook.command) {
                        return Err(HookError::UnsafeCommand(hook.command.clone()));
                    }
                }
                entries.push(entry);
            }
            events.insert(event, entries);
        }
        Ok(Self { events })
    }

    /// Merge user and project configurations. The project replaces the
    /// user's entire list per event, never appends to it.
    pub fn merge(user: Self, project: Self) -> Self {
        let mut events = user.events;
        for (event, entries) in project.events {
            events.insert(event, entries);
        }
        Self { events }
    }

    pub fn entries(&self, event: HookEvent) -> &[HookEntry] {
        self.events.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.events.values().all(Vec::is_empty)
    }
}

/// Glob-style matcher over a tool name; absent matcher matches any tool. A
/// pattern that fails to compile matches nothing.
pub fn matcher_applies(matcher: Option<&str>, tool_name: &str) -> bool {
    match matcher {
        None => true,
        Some(pattern) => Pattern::new(pattern)
            .map(|p| p.matches(tool_name))
            .unwrap_or(false),
    }
}

/// Conservative command safety predicate applied at validation time.
pub fn is_command_safe(command: &str) -> bool {
    const DENY: [&str; 5] = ["rm -rf /", "rm -rf /*", "mkfs", "dd if=", ":(){:|:&};:"];
    let trimmed = command.trim();
    !trimmed.is_empty() && !DENY.iter().any(|p| trimmed.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_valid_configuration() {
        let config = HookConfig::from_value(&json!({
            "PreToolUse": [
                { "matcher": "Edit", "hooks": [{ "command": "echo pre" }] }
            ],
            "Stop": [
                { "hooks": [{ "command": "echo stop" }] }
            ],
        }))
        .unwrap();
        assert_eq!(config.entries(HookEvent::PreToolUse).len(), 1);
        assert_eq!(config.entries(HookEvent::Stop).len(), 1);
        assert!(config.entries(HookEvent::Notification).is_empty());
    }

    #[test]
    fn rejects_unknown_event_names() {
        let err = HookConfig::from_value(&json!({ "OnBoot": [] })).unwrap_err();
        assert!(matches!(err, HookError::UnknownEvent(_)));
    }

    #[test]
    fn rejects_non_array_event_bodies() {
        let err = HookConfig::from_value(&json!({ "Stop": {} })).unwrap_err();
        assert!(matches!(err, HookError::NotAnArray(_)));
    }

    #[test]
    fn rejects_matcher_on_non_tool_events() {
        let err = HookConfig::from_value(&json!({
            "Stop": [ { "matcher": "*", "hooks": [{ "command": "echo" }] } ]
        }))
        .unwrap_err();
        assert!(matches!(err, HookError::MatcherOnNonToolEvent(_)));
    }

    #[test]
    fn rejects_unsafe_commands() {
        let err = HookConfig::from_value(&json!({
            "Stop": [ { "hooks": [{ "command": "rm -rf /" }] } ]
        }))
        .unwrap_err();
        assert!(matches!(err, HookError::UnsafeCommand(_)));
    }

    #[test]
    fn project_replaces_user_per_event() {
        let user = HookConfig::from_value(&json!({
            "PreToolUse": [ { "hooks": [{ "command": "echo user-pre" }] } ],
            "Stop": [ { "hooks": [{ "command": "echo user-stop" }] } ],
        }))
        .unwrap();
        let project = HookConfig::from_value(&json!({
            "PreToolUse": [ { "hooks": [{ "command": "echo project-pre" }] } ],
        }))
        .unwrap();
        let merged = HookConfig::merge(user, project);
        assert_eq!(
            merged.entries(HookEvent::PreToolUse)[0].hooks[0].command,
            "echo project-pre"
        );
        assert_eq!(
            merged.entries(HookEvent::Stop)[0].hooks[0].command,
            "echo user-stop"
        );
    }

    #[test]
    fn matcher_semantics() {
        assert!(matcher_applies(None, "Edit"));
        assert!(matcher_applies(Some("Edit"), "Edit"));
        assert!(matcher_applies(Some("*"), "Bash"));
        assert!(matcher_applies(Some("Edit*"), "EditFile"));
        assert!(!matcher_applies(Some("Edit"), "Bash"));
        assert!(!matcher_applies(Some("[invalid"), "Edit"));
    }
}
