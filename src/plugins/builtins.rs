//! Built-in plugin modules.
//!
//! These cover the common normalizations shipped with the relay; site
//! specific handlers (art fetchers and the like) are expected to be
//! registered by the embedding application.

use std::sync::Arc;

use crate::metadata::{MetaValue, Metadata};
use crate::plugins::{HandlerError, Predicate, PluginModule, Transform};
use crate::rules::parser::{RuleArgs, RuleValue};

pub fn modules() -> Vec<PluginModule> {
    vec![
        PluginModule::new("artists")
            .transform("fix_artists", || Box::new(FixArtists))
            .transform("strip_suffix", || Box::new(StripArtistSuffix)),
        PluginModule::new("util").transform("passthrough", || Box::new(Passthrough)),
        PluginModule::new("urls").predicate("has_host", Arc::new(HasHost)),
    ]
}

/// Splits combined artist entries ("A & B") into separate list elements.
struct FixArtists;

impl Transform for FixArtists {
    fn apply(&mut self, mut metadata: Metadata, args: &RuleArgs) -> Result<Metadata, HandlerError> {
        let separator = match args.kw.get("separator") {
            Some(RuleValue::Str(s)) => s.clone(),
            Some(_) => {
                return Err(HandlerError::new(
                    "artists.fix_artists",
                    "'separator' must be a string",
                ));
            }
            None => "&".to_string(),
        };
        if let Some(MetaValue::StrList(artists)) = metadata.get("xesam:artist") {
            let split: Vec<String> = artists
                .iter()
                .flat_map(|entry| entry.split(separator.as_str()))
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect();
            metadata.insert("xesam:artist".to_string(), MetaValue::StrList(split));
        }
        Ok(metadata)
    }
}

/// Removes a trailing marker (e.g. " - Topic") from each artist entry.
struct StripArtistSuffix;

impl Transform for StripArtistSuffix {
    fn apply(&mut self, mut metadata: Metadata, args: &RuleArgs) -> Result<Metadata, HandlerError> {
        let Some(RuleValue::Str(suffix)) = args.pos.first() else {
            return Err(HandlerError::new(
                "artists.strip_suffix",
                "requires one string argument",
            ));
        };
        if let Some(MetaValue::StrList(artists)) = metadata.get("xesam:artist") {
            let stripped: Vec<String> = artists
                .iter()
                .map(|entry| entry.trim_end_matches(suffix.as_str()).trim().to_string())
                .collect();
            metadata.insert("xesam:artist".to_string(), MetaValue::StrList(stripped));
        }
        Ok(metadata)
    }
}

struct Passthrough;

impl Transform for Passthrough {
    fn apply(&mut self, metadata: Metadata, _args: &RuleArgs) -> Result<Metadata, HandlerError> {
        Ok(metadata)
    }
}

/// True when the value contains the given host name.
struct HasHost;

impl Predicate for HasHost {
    fn evaluate(&self, value: &MetaValue, args: &RuleArgs) -> Result<bool, HandlerError> {
        let Some(RuleValue::Str(host)) = args.pos.first() else {
            return Err(HandlerError::new(
                "urls.has_host",
                "requires one string argument",
            ));
        };
        Ok(value.to_string().contains(host.as_str()))
    }
}
