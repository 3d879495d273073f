//! Compiled rule predicates evaluated against metadata dictionaries.
//!
//! Dispatch is a closed set of built-ins (`regexpr`, `pcre`, `contains`,
//! `equals`, `starts_with`, `ends_with`) plus dotted identifiers resolved
//! through the plugin registry. Clause-level failures evaluate to false;
//! only an unavailable PCRE engine is a hard error, surfaced when the rule
//! set is compiled.

use std::sync::Arc;

use regex::RegexBuilder;
use thiserror::Error;
use tracing::warn;

use crate::metadata::{MetaValue, Metadata};
use crate::plugins::{PluginError, PluginRegistry, Predicate};
use crate::rules::parser::{
    Clause, LogicalOp, ParsedRule, RuleArgs, RuleParseError, RuleValue, parse_rule,
};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error(transparent)]
    Parse(#[from] RuleParseError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("pcre() rules require this binary to be built with the 'pcre' feature")]
    PcreUnavailable,
}

/// A compiled rule, ready for evaluation.
pub enum RuleMatcher {
    /// The `always` sentinel: unconditionally true.
    Always,
    Rule(CompiledRule),
}

impl std::fmt::Debug for RuleMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleMatcher::Always => f.write_str("RuleMatcher::Always"),
            RuleMatcher::Rule(_) => f.write_str("RuleMatcher::Rule(..)"),
        }
    }
}

impl RuleMatcher {
    /// Compile a rule string against a plugin registry.
    pub fn compile(rule: &str, plugins: &PluginRegistry) -> Result<Self, RuleError> {
        let parsed = parse_rule(rule)?;
        if parsed.mixes_operators() {
            warn!(
                rule,
                "rule mixes logical operators; they fold left to right with no precedence"
            );
        }
        Ok(RuleMatcher::Rule(CompiledRule::compile(parsed, plugins)?))
    }

    pub fn evaluate(&self, metadata: &Metadata) -> bool {
        match self {
            RuleMatcher::Always => true,
            RuleMatcher::Rule(rule) => rule.evaluate(metadata),
        }
    }
}

pub struct CompiledRule {
    clauses: Vec<CompiledClause>,
    ops: Vec<LogicalOp>,
}

struct CompiledClause {
    negated: bool,
    key: String,
    predicate: ClausePredicate,
}

enum ClausePredicate {
    Regex(regex::Regex),
    #[cfg(feature = "pcre")]
    Pcre(fancy_regex::Regex),
    Builtin {
        kind: BuiltinPredicate,
        args: RuleArgs,
    },
    Plugin {
        id: String,
        predicate: Arc<dyn Predicate>,
        args: RuleArgs,
    },
    /// A clause that failed validation at compile time. A diagnostic has
    /// already been emitted; it evaluates to false, matching the original
    /// clause-failure behavior.
    Poisoned,
}

#[derive(Debug, Clone, Copy)]
enum BuiltinPredicate {
    Contains,
    Equals,
    StartsWith,
    EndsWith,
}

impl CompiledRule {
    fn compile(parsed: ParsedRule, plugins: &PluginRegistry) -> Result<Self, RuleError> {
        let mut clauses = Vec::with_capacity(parsed.clauses.len());
        for clause in parsed.clauses {
            clauses.push(compile_clause(clause, plugins)?);
        }
        Ok(Self {
            clauses,
            ops: parsed.ops,
        })
    }

    fn evaluate(&self, metadata: &Metadata) -> bool {
        let Some(first) = self.clauses.first() else {
            return true;
        };
        let mut result = first.evaluate(metadata);
        for (op, clause) in self.ops.iter().zip(self.clauses.iter().skip(1)) {
            result = op.apply(result, clause.evaluate(metadata));
        }
        result
    }
}

fn compile_clause(clause: Clause, plugins: &PluginRegistry) -> Result<CompiledClause, RuleError> {
    let Clause { negated, key, call } = clause;
    let predicate = match call.name.as_str() {
        "regexpr" => compile_regexpr(&key, &call.args),
        "pcre" => compile_pcre(&key, &call.args)?,
        name if name.contains('.') => ClausePredicate::Plugin {
            id: name.to_string(),
            predicate: plugins.resolve_predicate(name)?,
            args: call.args,
        },
        name => compile_builtin(&key, name, call.args),
    };
    Ok(CompiledClause {
        negated,
        key,
        predicate,
    })
}

fn compile_regexpr(key: &str, args: &RuleArgs) -> ClausePredicate {
    let Some(pattern) = args.pos.first().and_then(RuleValue::as_str) else {
        warn!(key, "regexpr requires one string argument for the pattern");
        return ClausePredicate::Poisoned;
    };
    if args.pos.len() != 1 || args.kw.keys().any(|k| k.as_str() != "flags") {
        warn!(key, "regexpr only supports the 'flags' keyword argument");
        return ClausePredicate::Poisoned;
    }

    let mut builder = RegexBuilder::new(pattern);
    if let Some(flags_value) = args.kw.get("flags") {
        let RuleValue::List(flags) = flags_value else {
            warn!(key, "'flags' argument must be a list, ignoring");
            return build_regex(key, &builder);
        };
        for flag in flags {
            match flag.as_str() {
                Some("IGNORECASE") | Some("I") => {
                    builder.case_insensitive(true);
                }
                Some("MULTILINE") | Some("M") => {
                    builder.multi_line(true);
                }
                Some("DOTALL") | Some("S") => {
                    builder.dot_matches_new_line(true);
                }
                Some("VERBOSE") | Some("X") => {
                    builder.ignore_whitespace(true);
                }
                Some("UNICODE") | Some("U") => {
                    builder.unicode(true);
                }
                Some(other) => {
                    warn!(key, flag = other, "unknown regex flag, ignoring");
                }
                None => {
                    warn!(key, "non-string regex flag, ignoring");
                }
            }
        }
    }
    build_regex(key, &builder)
}

fn build_regex(key: &str, builder: &RegexBuilder) -> ClausePredicate {
    match builder.build() {
        Ok(regex) => ClausePredicate::Regex(regex),
        Err(err) => {
            warn!(key, error = %err, "invalid regexpr pattern");
            ClausePredicate::Poisoned
        }
    }
}

#[cfg(feature = "pcre")]
fn compile_pcre(key: &str, args: &RuleArgs) -> Result<ClausePredicate, RuleError> {
    let Some(pattern) = args.pos.first().and_then(RuleValue::as_str) else {
        warn!(key, "pcre requires one string argument and no keyword arguments");
        return Ok(ClausePredicate::Poisoned);
    };
    if args.pos.len() != 1 || !args.kw.is_empty() {
        warn!(key, "pcre requires one string argument and no keyword arguments");
        return Ok(ClausePredicate::Poisoned);
    }
    match fancy_regex::Regex::new(pattern) {
        Ok(regex) => Ok(ClausePredicate::Pcre(regex)),
        Err(err) => {
            warn!(key, error = %err, "invalid pcre pattern");
            Ok(ClausePredicate::Poisoned)
        }
    }
}

#[cfg(not(feature = "pcre"))]
fn compile_pcre(_key: &str, _args: &RuleArgs) -> Result<ClausePredicate, RuleError> {
    Err(RuleError::PcreUnavailable)
}

fn compile_builtin(key: &str, name: &str, args: RuleArgs) -> ClausePredicate {
    let kind = match name {
        "contains" => BuiltinPredicate::Contains,
        "equals" => BuiltinPredicate::Equals,
        "starts_with" => BuiltinPredicate::StartsWith,
        "ends_with" => BuiltinPredicate::EndsWith,
        other => {
            warn!(key, method = other, "unknown predicate, clause will not match");
            return ClausePredicate::Poisoned;
        }
    };
    if args.pos.len() != 1 || !args.kw.is_empty() {
        warn!(key, method = name, "predicate requires exactly one argument");
        return ClausePredicate::Poisoned;
    }
    ClausePredicate::Builtin { kind, args }
}

impl CompiledClause {
    fn evaluate(&self, metadata: &Metadata) -> bool {
        let result = match metadata.get(&self.key) {
            None => false,
            Some(value) => self.predicate.evaluate(&self.key, value),
        };
        if self.negated { !result } else { result }
    }
}

impl ClausePredicate {
    fn evaluate(&self, key: &str, value: &MetaValue) -> bool {
        match self {
            ClausePredicate::Regex(regex) => regex.is_match(&value.to_string()),
            #[cfg(feature = "pcre")]
            ClausePredicate::Pcre(regex) => regex.is_match(&value.to_string()).unwrap_or(false),
            ClausePredicate::Builtin { kind, args } => {
                let arg = &args.pos[0];
                let text = value.to_string();
                match kind {
                    BuiltinPredicate::Contains => {
                        arg.as_str().is_some_and(|needle| text.contains(needle))
                    }
                    BuiltinPredicate::StartsWith => {
                        arg.as_str().is_some_and(|prefix| text.starts_with(prefix))
                    }
                    BuiltinPredicate::EndsWith => {
                        arg.as_str().is_some_and(|suffix| text.ends_with(suffix))
                    }
                    BuiltinPredicate::Equals => literal_equals_value(arg, value),
                }
            }
            ClausePredicate::Plugin {
                id,
                predicate,
                args,
            } => match predicate.evaluate(value, args) {
                Ok(result) => result,
                Err(err) => {
                    warn!(key, plugin = id.as_str(), error = %err, "predicate failed");
                    false
                }
            },
            ClausePredicate::Poisoned => false,
        }
    }
}

fn literal_equals_value(literal: &RuleValue, value: &MetaValue) -> bool {
    match (literal, value) {
        (RuleValue::Str(a), MetaValue::Str(b)) => a == b,
        (RuleValue::Int(a), MetaValue::Int(b)) => a == b,
        (RuleValue::Int(a), MetaValue::Float(b)) => (*a as f64) == *b,
        (RuleValue::Float(a), MetaValue::Float(b)) => a == b,
        (RuleValue::Float(a), MetaValue::Int(b)) => *a == (*b as f64),
        _ => literal_display(literal) == value.to_string(),
    }
}

fn literal_display(literal: &RuleValue) -> String {
    match literal {
        RuleValue::Str(s) => s.clone(),
        RuleValue::Int(i) => i.to_string(),
        RuleValue::Float(v) => v.to_string(),
        RuleValue::Bool(b) => b.to_string(),
        RuleValue::List(items) => items
            .iter()
            .map(literal_display)
            .collect::<Vec<_>>()
            .join(", "),
    }
}
