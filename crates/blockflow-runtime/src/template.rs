//! Placeholder rendering for prompts and embedding templates.
//!
//! Placeholders are written `{{name}}` or `{{name.field.path}}`. The root
//! `REQUEST_TEXT` resolves to the task text; any other root names a block
//! whose structured output is looked up in [`Bindings`].
//!
//! Field resolution is lenient. An exact dotted path wins; otherwise a
//! case-insensitive substring match against sibling keys is tried, then the
//! first non-null sibling value. Sibling keys are visited in the order the
//! model wrote them. Every lenient step and every unresolved placeholder is
//! reported as a [`RenderWarning`] instead of an error.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Binding name that resolves to the task's request text.
pub const REQUEST_TEXT: &str = "REQUEST_TEXT";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid placeholder regex"));

/// A placeholder found in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder<'a> {
    /// Block name or [`REQUEST_TEXT`].
    pub root: &'a str,
    /// Dotted field path after the root, if any.
    pub path: Option<&'a str>,
}

/// Iterates over the placeholders of a template in order of appearance.
pub fn placeholders(template: &str) -> impl Iterator<Item = Placeholder<'_>> {
    PLACEHOLDER.captures_iter(template).filter_map(|caps| {
        let inner = caps.get(1)?.as_str();
        Some(split_placeholder(inner))
    })
}

fn split_placeholder(inner: &str) -> Placeholder<'_> {
    match inner.split_once('.') {
        Some((root, path)) => Placeholder {
            root: root.trim(),
            path: Some(path.trim()).filter(|p| !p.is_empty()),
        },
        None => Placeholder {
            root: inner.trim(),
            path: None,
        },
    }
}

/// Values available to a template: the request text plus every structured
/// output produced so far, keyed by block name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bindings {
    request_text: String,
    outputs: BTreeMap<String, Value>,
}

impl Bindings {
    /// Creates bindings holding only the request text.
    pub fn new(request_text: impl Into<String>) -> Self {
        Self {
            request_text: request_text.into(),
            outputs: BTreeMap::new(),
        }
    }

    /// Records the structured output of a block.
    pub fn insert(&mut self, block_name: impl Into<String>, output: Value) {
        self.outputs.insert(block_name.into(), output);
    }

    /// Adds a block output, builder style.
    pub fn with_output(mut self, block_name: impl Into<String>, output: Value) -> Self {
        self.insert(block_name, output);
        self
    }

    /// Returns the request text.
    pub fn request_text(&self) -> &str {
        &self.request_text
    }

    /// Returns the output of a block.
    pub fn get(&self, block_name: &str) -> Option<&Value> {
        self.outputs.get(block_name)
    }

    /// Iterates over block outputs in name order.
    pub fn outputs(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.outputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of block outputs.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Returns true if no block has produced output yet.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Why a placeholder was not rendered exactly as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderWarningKind {
    /// No output is bound under the placeholder's root; the literal was kept.
    UnknownBinding,
    /// A field was matched case-insensitively by substring.
    FuzzyFieldMatch { requested: String, matched: String },
    /// No field matched; the first non-null sibling was used instead.
    SiblingFallback { requested: String, used: String },
    /// A field path was requested from a scalar output; the scalar was used.
    ScalarOutput,
    /// Nothing usable was found; the literal was kept.
    UnresolvedField { requested: String },
}

/// A non-fatal rendering problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderWarning {
    /// The placeholder as written, including braces.
    pub placeholder: String,
    #[serde(flatten)]
    pub kind: RenderWarningKind,
}

impl RenderWarning {
    /// Returns true if the placeholder was left in the output verbatim.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self.kind,
            RenderWarningKind::UnknownBinding | RenderWarningKind::UnresolvedField { .. }
        )
    }
}

/// Result of rendering a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rendered {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RenderWarning>,
}

impl Rendered {
    /// Returns true if any placeholder was left unresolved.
    pub fn has_unresolved(&self) -> bool {
        self.warnings.iter().any(RenderWarning::is_unresolved)
    }
}

/// Renders `template` against `bindings`.
pub fn render(template: &str, bindings: &Bindings) -> Rendered {
    let mut warnings = Vec::new();

    let text = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let literal = &caps[0];
        let placeholder = split_placeholder(&caps[1]);

        match resolve(&placeholder, bindings) {
            Resolution::Value(value, warning) => {
                if let Some(kind) = warning {
                    warnings.push(RenderWarning {
                        placeholder: literal.to_string(),
                        kind,
                    });
                }
                value_to_text(value).into_owned()
            }
            Resolution::Text(text) => text.to_string(),
            Resolution::Unresolved(kind) => {
                warnings.push(RenderWarning {
                    placeholder: literal.to_string(),
                    kind,
                });
                literal.to_string()
            }
        }
    });

    Rendered {
        text: text.into_owned(),
        warnings,
    }
}

enum Resolution<'a> {
    Text(&'a str),
    Value(&'a Value, Option<RenderWarningKind>),
    Unresolved(RenderWarningKind),
}

fn resolve<'a>(placeholder: &Placeholder<'_>, bindings: &'a Bindings) -> Resolution<'a> {
    if placeholder.root == REQUEST_TEXT && placeholder.path.is_none() {
        return Resolution::Text(bindings.request_text());
    }

    let Some(output) = bindings.get(placeholder.root) else {
        return Resolution::Unresolved(RenderWarningKind::UnknownBinding);
    };

    let Some(path) = placeholder.path else {
        return Resolution::Value(output, None);
    };

    if !(output.is_object() || output.is_array()) {
        return Resolution::Value(output, Some(RenderWarningKind::ScalarOutput));
    }

    resolve_path(output, path)
}

fn resolve_path<'a>(root: &'a Value, path: &str) -> Resolution<'a> {
    let mut current = root;
    let mut warning = None;

    for segment in path.split('.').map(str::trim) {
        if let Some(next) = step(current, segment) {
            current = next;
            continue;
        }

        let Value::Object(siblings) = current else {
            return Resolution::Unresolved(RenderWarningKind::UnresolvedField {
                requested: path.to_string(),
            });
        };

        if let Some((key, next)) = fuzzy_match(siblings, segment) {
            warning.get_or_insert(RenderWarningKind::FuzzyFieldMatch {
                requested: segment.to_string(),
                matched: key.clone(),
            });
            current = next;
            continue;
        }

        return match siblings.iter().find(|(_, value)| !value.is_null()) {
            Some((key, value)) => Resolution::Value(
                value,
                Some(RenderWarningKind::SiblingFallback {
                    requested: segment.to_string(),
                    used: key.clone(),
                }),
            ),
            None => Resolution::Unresolved(RenderWarningKind::UnresolvedField {
                requested: path.to_string(),
            }),
        };
    }

    Resolution::Value(current, warning)
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn fuzzy_match<'a>(siblings: &'a Map<String, Value>, segment: &str) -> Option<(&'a String, &'a Value)> {
    let needle = segment.to_lowercase();
    if needle.is_empty() {
        return None;
    }

    siblings.iter().find(|(key, _)| {
        let key = key.to_lowercase();
        key.contains(&needle) || needle.contains(&key)
    })
}

fn value_to_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s),
        other => Cow::Owned(other.to_string()),
    }
}
