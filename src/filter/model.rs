//! Filter rules and chat-level settings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FilterError;

/// What a filter rule does to the text it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    /// Delete every occurrence of the pattern.
    RemoveWord,
    /// Substitute every occurrence of the pattern.
    ReplaceWord,
    /// Drop every line the pattern matches.
    RemoveLine,
    /// Replace every line the pattern matches.
    ReplaceLine,
    /// Substitute with the pattern taken as a regular expression.
    RegexReplace,
    /// Insert a line at the start of the text.
    PrependText,
    /// Insert a line at the end of the text.
    AppendText,
    /// Accepted for compatibility; applying it changes nothing. URL
    /// stripping is a settings toggle, not a rule.
    RemoveUrl,
}

impl FilterAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterAction::RemoveWord => "remove_word",
            FilterAction::ReplaceWord => "replace_word",
            FilterAction::RemoveLine => "remove_line",
            FilterAction::ReplaceLine => "replace_line",
            FilterAction::RegexReplace => "regex_replace",
            FilterAction::PrependText => "prepend_text",
            FilterAction::AppendText => "append_text",
            FilterAction::RemoveUrl => "remove_url",
        }
    }

    /// Substitution actions must carry a replacement at creation time.
    pub fn requires_replacement(&self) -> bool {
        matches!(
            self,
            FilterAction::ReplaceWord | FilterAction::ReplaceLine | FilterAction::RegexReplace
        )
    }
}

impl fmt::Display for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FilterAction {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remove_word" => Ok(FilterAction::RemoveWord),
            "replace_word" => Ok(FilterAction::ReplaceWord),
            "remove_line" => Ok(FilterAction::RemoveLine),
            "replace_line" => Ok(FilterAction::ReplaceLine),
            "regex_replace" => Ok(FilterAction::RegexReplace),
            "prepend_text" => Ok(FilterAction::PrependText),
            "append_text" => Ok(FilterAction::AppendText),
            "remove_url" => Ok(FilterAction::RemoveUrl),
            other => Err(FilterError::UnknownAction(other.to_string())),
        }
    }
}

/// A stored filter rule.
///
/// Rules are applied in ascending creation order; `pattern` is matched
/// literally unless `is_regex` is set (the `regex_replace` action treats
/// it as a regex either way).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: Uuid,
    pub name: String,
    pub action: FilterAction,
    pub pattern: String,
    pub replacement: Option<String>,
    pub is_regex: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a filter rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFilter {
    pub name: String,
    pub action: FilterAction,
    pub pattern: String,
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default)]
    pub is_regex: bool,
}

impl NewFilter {
    /// Reject rules that could never apply cleanly: blank names or
    /// patterns, and substitution actions without a replacement.
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.name.trim().is_empty() {
            return Err(FilterError::EmptyName);
        }
        if self.pattern.is_empty() {
            return Err(FilterError::EmptyPattern);
        }
        if self.action.requires_replacement()
            && self.replacement.as_deref().is_none_or(|r| r.is_empty())
        {
            return Err(FilterError::MissingReplacement {
                action: self.action.to_string(),
            });
        }
        Ok(())
    }
}

/// Chat-level toggles applied before any rule runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Drop every line containing an `@mention` token.
    pub remove_mention: bool,
    /// Drop every line containing an http(s) URL.
    pub remove_url: bool,
}
