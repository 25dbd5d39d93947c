//! Deterministic text transformation engine.
//!
//! `apply` is a total function: a rule that cannot compile degrades to a
//! no-op for that call, logged and skipped, and the remaining rules still
//! run. Settings toggles run before any rule, rules run in ascending
//! creation order.

use regex::{NoExpand, Regex, RegexBuilder};

use crate::filter::model::{FilterAction, FilterRule, Settings};

const MENTION_PATTERN: &str = r"@[A-Za-z0-9_]+";
const URL_PATTERN: &str = r"https?://\S+";

/// Run the settings pre-pass and every rule over `text`.
///
/// Callers pass the active rules already ordered by creation time.
pub fn apply(text: &str, settings: &Settings, filters: &[FilterRule]) -> String {
    let mut current = text.to_string();

    if settings.remove_mention {
        current = drop_lines_matching(&current, MENTION_PATTERN);
    }
    if settings.remove_url {
        current = drop_lines_matching(&current, URL_PATTERN);
    }

    for rule in filters {
        current = apply_rule(&current, rule);
    }

    current
}

fn apply_rule(text: &str, rule: &FilterRule) -> String {
    match rule.action {
        FilterAction::RemoveWord => substitute(text, rule, ""),
        FilterAction::ReplaceWord => {
            substitute(text, rule, rule.replacement.as_deref().unwrap_or(""))
        }
        FilterAction::RemoveLine => remove_line(text, rule),
        FilterAction::ReplaceLine => replace_line(text, rule),
        FilterAction::RegexReplace => regex_replace(text, rule),
        FilterAction::PrependText => prepend_text(text, rule),
        FilterAction::AppendText => append_text(text, rule),
        // Declared but inert; URL stripping is the settings toggle.
        FilterAction::RemoveUrl => text.to_string(),
    }
}

/// Compile a rule's pattern, case-insensitive. Literal patterns are
/// escaped first and cannot fail; a broken `is_regex` pattern logs and
/// yields `None`.
fn rule_regex(rule: &FilterRule) -> Option<Regex> {
    let source = if rule.is_regex {
        rule.pattern.clone()
    } else {
        regex::escape(&rule.pattern)
    };
    match RegexBuilder::new(&source).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!("Filter {:?} has an invalid pattern, skipping: {e}", rule.name);
            None
        }
    }
}

/// Match-all substitution across the whole text. Literal rules replace
/// verbatim; regex rules keep `$1`-style group expansion.
fn substitute(text: &str, rule: &FilterRule, replacement: &str) -> String {
    let Some(re) = rule_regex(rule) else {
        return text.to_string();
    };
    if rule.is_regex {
        re.replace_all(text, replacement).into_owned()
    } else {
        re.replace_all(text, NoExpand(replacement)).into_owned()
    }
}

fn remove_line(text: &str, rule: &FilterRule) -> String {
    let Some(re) = rule_regex(rule) else {
        return text.to_string();
    };
    text.split('\n')
        .filter(|line| !re.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn replace_line(text: &str, rule: &FilterRule) -> String {
    let Some(re) = rule_regex(rule) else {
        return text.to_string();
    };
    let replacement = rule.replacement.as_deref().unwrap_or("");
    text.split('\n')
        .map(|line| if re.is_match(line) { replacement } else { line })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pattern compiled verbatim, case-insensitive. A compile failure makes
/// this rule a no-op for the call.
fn regex_replace(text: &str, rule: &FilterRule) -> String {
    match RegexBuilder::new(&rule.pattern)
        .case_insensitive(true)
        .build()
    {
        Ok(re) => re
            .replace_all(text, rule.replacement.as_deref().unwrap_or(""))
            .into_owned(),
        Err(e) => {
            tracing::warn!("Filter {:?} has an invalid regex, skipping: {e}", rule.name);
            text.to_string()
        }
    }
}

fn inserted_line(rule: &FilterRule) -> &str {
    rule.replacement
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or(&rule.pattern)
}

fn prepend_text(text: &str, rule: &FilterRule) -> String {
    let prefix = inserted_line(rule);
    if text.starts_with('\n') {
        format!("{prefix}{text}")
    } else {
        format!("{prefix}\n{text}")
    }
}

fn append_text(text: &str, rule: &FilterRule) -> String {
    let suffix = inserted_line(rule);
    if text.ends_with('\n') {
        format!("{text}{suffix}")
    } else {
        format!("{text}\n{suffix}")
    }
}

fn drop_lines_matching(text: &str, pattern: &str) -> String {
    let Ok(re) = Regex::new(pattern) else {
        return text.to_string();
    };
    text.split('\n')
        .filter(|line| !re.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}
