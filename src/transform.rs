//! Rule-driven metadata transformation engine.
//!
//! Compiled once from the configured rule set, then applied to every new
//! metadata dictionary before distribution. Handlers run in rule-set order
//! and each sees the cumulative output of the handlers before it.

use tracing::debug;

use crate::metadata::Metadata;
use crate::plugins::{HandlerError, PluginRegistry, Transform};
use crate::rules::parser::RuleArgs;
use crate::rules::{RuleError, RuleMatcher, parse_call};

/// One configured rule-set entry: a rule string (or the literal `always`)
/// and a handler call such as `artists.fix_artists()`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSetEntry {
    pub rule: String,
    pub handler: String,
}

struct Entry {
    matcher: RuleMatcher,
    handler: Box<dyn Transform>,
    handler_id: String,
    args: RuleArgs,
}

/// The ordered (predicate, handler) pipeline.
pub struct TransformEngine {
    entries: Vec<Entry>,
}

impl std::fmt::Debug for TransformEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformEngine")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl TransformEngine {
    /// Compile the rule set. Fails on malformed rules, unknown handlers,
    /// or `pcre()` use without the engine available.
    pub fn compile(ruleset: &[RuleSetEntry], plugins: &PluginRegistry) -> Result<Self, RuleError> {
        let mut entries = Vec::with_capacity(ruleset.len());
        for entry in ruleset {
            let matcher = if entry.rule == "always" {
                RuleMatcher::Always
            } else {
                RuleMatcher::compile(&entry.rule, plugins)?
            };
            let call = parse_call(&entry.handler)?;
            let handler = plugins.resolve_transform(&call.name)?;
            entries.push(Entry {
                matcher,
                handler,
                handler_id: call.name,
                args: call.args,
            });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the pipeline over a copy of `metadata`.
    ///
    /// A handler error aborts the run; the caller decides what to do with
    /// the previous metadata.
    pub fn apply(&mut self, metadata: &Metadata) -> Result<Metadata, HandlerError> {
        debug!("starting metadata transformation");
        let mut working = metadata.clone();
        for entry in &mut self.entries {
            if entry.matcher.evaluate(&working) {
                debug!(handler = entry.handler_id.as_str(), "rule matched");
                working = entry.handler.apply(working, &entry.args)?;
            }
        }
        debug!("finished metadata transformation");
        Ok(working)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetaValue;
    use crate::plugins::PluginModule;
    use assert_matches::assert_matches;

    fn entry(rule: &str, handler: &str) -> RuleSetEntry {
        RuleSetEntry {
            rule: rule.to_string(),
            handler: handler.to_string(),
        }
    }

    fn base_metadata() -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("xesam:title".to_string(), MetaValue::from("Song"));
        metadata.insert(
            "xesam:artist".to_string(),
            MetaValue::StrList(vec!["A & B - Topic".to_string()]),
        );
        metadata
    }

    #[test]
    fn always_rule_applies_handler() {
        let plugins = PluginRegistry::with_builtins();
        let mut engine =
            TransformEngine::compile(&[entry("always", "artists.fix_artists()")], &plugins)
                .unwrap();
        let out = engine.apply(&base_metadata()).unwrap();
        assert_eq!(
            out["xesam:artist"],
            MetaValue::StrList(vec!["A".to_string(), "B - Topic".to_string()])
        );
    }

    #[test]
    fn handlers_apply_in_order_and_see_prior_output() {
        let plugins = PluginRegistry::with_builtins();
        let mut engine = TransformEngine::compile(
            &[
                entry("always", r#"artists.strip_suffix("- Topic")"#),
                entry("always", "artists.fix_artists()"),
            ],
            &plugins,
        )
        .unwrap();
        let out = engine.apply(&base_metadata()).unwrap();
        // Suffix stripped first, then the remaining entry split on '&'.
        assert_eq!(
            out["xesam:artist"],
            MetaValue::StrList(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn non_matching_rule_skips_handler() {
        let plugins = PluginRegistry::with_builtins();
        let mut engine = TransformEngine::compile(
            &[entry(
                r#"||xesam:title <-> equals("Other")||"#,
                "artists.fix_artists()",
            )],
            &plugins,
        )
        .unwrap();
        let input = base_metadata();
        let out = engine.apply(&input).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn input_dictionary_is_not_mutated() {
        let plugins = PluginRegistry::with_builtins();
        let mut engine =
            TransformEngine::compile(&[entry("always", "artists.fix_artists()")], &plugins)
                .unwrap();
        let input = base_metadata();
        let _ = engine.apply(&input).unwrap();
        assert_eq!(input, base_metadata());
    }

    #[test]
    fn unknown_handler_fails_compilation() {
        let plugins = PluginRegistry::with_builtins();
        assert_matches!(
            TransformEngine::compile(&[entry("always", "nosuch.handler()")], &plugins),
            Err(RuleError::Plugin(_))
        );
    }

    #[test]
    fn malformed_handler_call_fails_compilation() {
        let plugins = PluginRegistry::with_builtins();
        assert_matches!(
            TransformEngine::compile(&[entry("always", "artists.fix_artists")], &plugins),
            Err(RuleError::Parse(_))
        );
    }

    #[test]
    fn handler_error_propagates() {
        let plugins = PluginRegistry::with_builtins();
        // strip_suffix without its required argument fails at apply time.
        let mut engine =
            TransformEngine::compile(&[entry("always", "artists.strip_suffix()")], &plugins)
                .unwrap();
        assert!(engine.apply(&base_metadata()).is_err());
    }

    #[test]
    fn each_entry_gets_its_own_handler_instance() {
        use crate::plugins::{HandlerError, Transform};

        struct Counter {
            count: u64,
        }
        impl Transform for Counter {
            fn apply(
                &mut self,
                mut metadata: Metadata,
                _args: &RuleArgs,
            ) -> Result<Metadata, HandlerError> {
                self.count += 1;
                metadata.insert("test:count".to_string(), MetaValue::Int(self.count as i64));
                Ok(metadata)
            }
        }

        let mut plugins = PluginRegistry::with_builtins();
        plugins.register(
            PluginModule::new("counting").transform("count", || Box::new(Counter { count: 0 })),
        );
        let mut engine = TransformEngine::compile(
            &[
                entry("always", "counting.count()"),
                entry("always", "counting.count()"),
            ],
            &plugins,
        )
        .unwrap();
        let out = engine.apply(&Metadata::new()).unwrap();
        // Both instances ran once each; a shared instance would report 2
        // from the first entry already.
        assert_eq!(out["test:count"], MetaValue::Int(1));
        let out = engine.apply(&Metadata::new()).unwrap();
        assert_eq!(out["test:count"], MetaValue::Int(2));
    }
}
