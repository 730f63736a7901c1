//! Slash contract (C8): parsing and classification of slash commands.
//!
//! Kept as a pure leaf module per the design note on the rpc ↔
//! slash-contract cycle: C9 (`rpc.rs`) imports this module, never the other
//! way around.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseKind {
    NotSlash,
    Invalid,
    Slash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub kind: ParseKind,
    pub command_name: Option<String>,
    pub args: String,
}

/// Well-known commands handled locally rather than forwarded to the agent.
pub const LOCAL_COMMANDS: &[&str] = &["new", "tts", "jobs", "job", "cancel", "help"];

/// Aliases mapping a forwarded command name to the agent's skill name.
fn alias_target(name: &str) -> Option<&'static str> {
    match name {
        "plan" => Some("plan"),
        "code" => Some("code"),
        _ => None,
    }
}

/// Parse `"/cmd args"`. A leading `//` is an escape and is treated as
/// not-slash.
pub fn parse(message: &str) -> ParsedCommand {
    if !message.starts_with('/') {
        return ParsedCommand {
            kind: ParseKind::NotSlash,
            command_name: None,
            args: String::new(),
        };
    }
    if message.starts_with("//") {
        return ParsedCommand {
            kind: ParseKind::NotSlash,
            command_name: None,
            args: String::new(),
        };
    }

    let rest = &message[1..];
    let mut parts = rest.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim().to_string();

    if head.is_empty() {
        return ParsedCommand {
            kind: ParseKind::Invalid,
            command_name: None,
            args,
        };
    }

    ParsedCommand {
        kind: ParseKind::Slash,
        command_name: Some(head.to_string()),
        args,
    }
}

/// Normalize a mention-suffix form `/cmd@botname` to `/cmd` when the suffix
/// matches `bot_username` (case-insensitive).
pub fn normalize_mention_suffix(command_name: &str, bot_username: &str) -> String {
    if let Some((name, suffix)) = command_name.split_once('@') {
        if !bot_username.is_empty() && suffix.eq_ignore_ascii_case(bot_username) {
            return name.to_string();
        }
    }
    command_name.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    NotSlash,
    Invalid,
    Supported { command: String },
    InteractiveOnly,
    Unsupported,
}

/// Classify a message against the discovered agent command inventory.
///
/// `command_index` maps command name → whether it is interactive-only.
pub fn classify(
    message: &str,
    command_index: &HashMap<String, bool>,
    bot_username: &str,
) -> Classification {
    let parsed = parse(message);
    let name = match parsed.kind {
        ParseKind::NotSlash => return Classification::NotSlash,
        ParseKind::Invalid => return Classification::Invalid,
        ParseKind::Slash => parsed.command_name.unwrap(),
    };

    let normalized = normalize_mention_suffix(&name, bot_username);
    let target = alias_target(&normalized).unwrap_or(normalized.as_str());

    if LOCAL_COMMANDS.contains(&target) {
        return Classification::Supported {
            command: target.to_string(),
        };
    }

    match command_index.get(target) {
        Some(true) => Classification::InteractiveOnly,
        Some(false) => Classification::Supported {
            command: target.to_string(),
        },
        None => Classification::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_not_slash() {
        let parsed = parse("hello there");
        assert_eq!(parsed.kind, ParseKind::NotSlash);
    }

    #[test]
    fn parse_escaped_double_slash_is_not_slash() {
        let parsed = parse("//not a command");
        assert_eq!(parsed.kind, ParseKind::NotSlash);
    }

    #[test]
    fn parse_invalid_bare_slash() {
        let parsed = parse("/");
        assert_eq!(parsed.kind, ParseKind::Invalid);
    }

    #[test]
    fn parse_slash_with_args() {
        let parsed = parse("/plan build a parser");
        assert_eq!(parsed.kind, ParseKind::Slash);
        assert_eq!(parsed.command_name.as_deref(), Some("plan"));
        assert_eq!(parsed.args, "build a parser");
    }

    #[test]
    fn normalize_mention_suffix_matching_bot() {
        assert_eq!(normalize_mention_suffix("status@MyBot", "mybot"), "status");
    }

    #[test]
    fn normalize_mention_suffix_other_bot_unchanged() {
        assert_eq!(
            normalize_mention_suffix("status@OtherBot", "mybot"),
            "status@OtherBot"
        );
    }

    #[test]
    fn classify_local_command_is_supported() {
        let index = HashMap::new();
        assert_eq!(
            classify("/new", &index, "mybot"),
            Classification::Supported { command: "new".into() }
        );
    }

    #[test]
    fn classify_unsupported_when_not_in_inventory() {
        let index = HashMap::new();
        assert_eq!(classify("/nope", &index, "mybot"), Classification::Unsupported);
    }

    #[test]
    fn classify_interactive_only() {
        let mut index = HashMap::new();
        index.insert("status".to_string(), true);
        assert_eq!(classify("/status", &index, "mybot"), Classification::InteractiveOnly);
    }

    #[test]
    fn classify_alias_maps_to_skill_name() {
        let mut index = HashMap::new();
        index.insert("plan".to_string(), false);
        assert_eq!(
            classify("/plan do it", &index, "mybot"),
            Classification::Supported { command: "plan".into() }
        );
    }
}
