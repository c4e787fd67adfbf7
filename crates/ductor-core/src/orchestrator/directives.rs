//! Inline `@model` directive parsing for chat messages.

use std::collections::BTreeSet;

/// Parsed directive state for one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    /// Model selected by a leading `@<model>` token, when recognized.
    pub model: Option<String>,
    /// Message text with leading directive tokens stripped.
    pub cleaned: String,
    /// True when the message consisted of directives only (no content).
    pub is_directive_only: bool,
}

impl Directives {
    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }
}

/// Scan leading whitespace-delimited tokens for `@<identifier>` directives.
///
/// Only identifiers present in `known_models` are consumed; an unknown
/// `@token` stays part of the message. The last recognized directive wins.
pub fn parse_directives(text: &str, known_models: &BTreeSet<String>) -> Directives {
    let mut model: Option<String> = None;
    let mut rest = text.trim_start();

    loop {
        let Some(token) = rest.split_whitespace().next() else {
            break;
        };
        let Some(candidate) = token.strip_prefix('@') else {
            break;
        };
        if !known_models.contains(candidate) {
            break;
        }
        model = Some(candidate.to_string());
        rest = rest[token.len()..].trim_start();
    }

    Directives {
        model,
        cleaned: rest.trim().to_string(),
        is_directive_only: rest.trim().is_empty(),
    }
}
