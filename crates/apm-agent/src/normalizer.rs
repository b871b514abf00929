// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rewrites raw request identifiers into normalized metric names.
//!
//! Rules arrive from the collector as JSON:
//!
//! ```json
//! [{"match_expression": "^[0-9]+$", "replacement": "*", "each_segment": true,
//!   "eval_order": 1, "terminate_chain": false, "ignore": false, "replace_all": false}]
//! ```
//!
//! Rules are evaluated in ascending `eval_order`. A rule set is immutable once
//! built; a new set replaces the active one wholesale and no metric recorded
//! under an older set is renamed.

use crate::errors::RuleError;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::borrow::Cow;
use tracing::debug;

/// A rule as received from the collector, before its pattern is compiled.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleSpec {
    pub match_expression: String,
    pub replacement: String,
    pub eval_order: i64,
    pub terminate_chain: bool,
    pub each_segment: bool,
    pub ignore: bool,
    pub replace_all: bool,
}

#[derive(Clone, Debug)]
pub struct NormalizationRule {
    pattern: Regex,
    replacement: String,
    eval_order: i64,
    terminate_chain: bool,
    each_segment: bool,
    ignore: bool,
    replace_all: bool,
}

impl NormalizationRule {
    pub fn new(spec: &RuleSpec) -> Result<Self, RuleError> {
        let pattern = RegexBuilder::new(&spec.match_expression)
            .case_insensitive(true)
            .build()
            .map_err(|source| RuleError::InvalidPattern {
                pattern: spec.match_expression.clone(),
                source,
            })?;
        Ok(Self {
            pattern,
            replacement: convert_backreferences(&spec.replacement),
            eval_order: spec.eval_order,
            terminate_chain: spec.terminate_chain,
            each_segment: spec.each_segment,
            ignore: spec.ignore,
            replace_all: spec.replace_all,
        })
    }

    pub fn eval_order(&self) -> i64 {
        self.eval_order
    }

    /// Applies the rule, returning the rewritten input when it matched.
    fn apply(&self, input: &str) -> Option<String> {
        if self.each_segment {
            let mut matched = false;
            let segments: Vec<Cow<'_, str>> = input
                .split('/')
                .map(|segment| {
                    if segment.is_empty() || !self.pattern.is_match(segment) {
                        return Cow::Borrowed(segment);
                    }
                    matched = true;
                    self.replace(segment)
                })
                .collect();
            matched.then(|| segments.join("/"))
        } else if self.pattern.is_match(input) {
            Some(self.replace(input).into_owned())
        } else {
            None
        }
    }

    fn replace<'a>(&self, input: &'a str) -> Cow<'a, str> {
        if self.replace_all {
            self.pattern.replace_all(input, self.replacement.as_str())
        } else {
            self.pattern.replace(input, self.replacement.as_str())
        }
    }
}

/// Outcome of normalizing a name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Normalized {
    /// No rule matched; the raw name passes through.
    Unchanged(String),
    /// At least one rule matched and rewrote the name.
    Renamed(String),
    /// A matching rule asked for the metric to be dropped.
    Ignored,
}

impl Normalized {
    pub fn name(&self) -> Option<&str> {
        match self {
            Normalized::Unchanged(name) | Normalized::Renamed(name) => Some(name),
            Normalized::Ignored => None,
        }
    }
}

/// An ordered, immutable rule set.
#[derive(Clone, Debug, Default)]
pub struct MetricNormalizer {
    rules: Vec<NormalizationRule>,
}

impl MetricNormalizer {
    /// Builds a rule set. Any rule with an invalid pattern rejects the whole set.
    pub fn new(specs: &[RuleSpec]) -> Result<Self, RuleError> {
        let mut rules = specs
            .iter()
            .map(NormalizationRule::new)
            .collect::<Result<Vec<_>, _>>()?;
        // Stable sort keeps the received order for rules sharing an eval_order.
        rules.sort_by_key(NormalizationRule::eval_order);
        Ok(Self { rules })
    }

    /// Builds a rule set from a collector payload.
    pub fn from_value(value: &Value) -> Result<Self, RuleError> {
        if value.is_null() {
            return Err(RuleError::Null);
        }
        let specs: Vec<RuleSpec> = serde_json::from_value(value.clone())?;
        Self::new(&specs)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn normalize(&self, raw: &str) -> Normalized {
        let mut current = raw.to_string();
        let mut matched = false;
        for rule in &self.rules {
            let Some(rewritten) = rule.apply(&current) else {
                continue;
            };
            if rule.ignore {
                debug!("Ignoring metric {raw}: matched rule {}", rule.pattern);
                return Normalized::Ignored;
            }
            matched = true;
            current = rewritten;
            if rule.terminate_chain {
                break;
            }
        }
        if matched {
            Normalized::Renamed(current)
        } else {
            Normalized::Unchanged(current)
        }
    }
}

/// Turns `\1` style backreferences into the `${1}` form used by `regex`.
fn convert_backreferences(replacement: &str) -> String {
    let mut converted = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek().is_some_and(char::is_ascii_digit) => {
                converted.push_str("${");
                while let Some(digit) = chars.next_if(char::is_ascii_digit) {
                    converted.push(digit);
                }
                converted.push('}');
            }
            '$' => converted.push_str("$$"),
            _ => converted.push(ch),
        }
    }
    converted
}
