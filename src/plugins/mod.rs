//! Plugin registry: resolves `module.symbol` identifiers to callable
//! handlers.
//!
//! Handlers come in two kinds: transforms (rewrite a metadata dictionary)
//! and predicates (extend the rule matcher). Modules are registered tables
//! of symbols; user-registered modules are searched before the built-in
//! namespace, so a user module can shadow a built-in of the same name.

pub mod builtins;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::metadata::{MetaValue, Metadata};
use crate::rules::parser::RuleArgs;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin identifier '{0}' must have the form 'module.symbol'")]
    MalformedIdentifier(String),
    #[error("module '{0}' not found in registered or built-in modules")]
    ModuleNotFound(String),
    #[error("symbol '{symbol}' not found in module '{module}'")]
    SymbolNotFound { module: String, symbol: String },
    #[error("symbol '{id}' is not a {expected}")]
    WrongKind { id: String, expected: &'static str },
}

/// A transformation handler failed while rewriting metadata.
#[derive(Debug, Error)]
#[error("handler '{handler}' failed: {message}")]
pub struct HandlerError {
    pub handler: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// A metadata transformation step.
///
/// Receives the cumulative output of earlier handlers and returns a full
/// replacement dictionary. Handlers that need cross-invocation memory keep
/// it behind `&mut self`; every rule-set entry gets its own instance.
pub trait Transform: Send {
    fn apply(&mut self, metadata: Metadata, args: &RuleArgs) -> Result<Metadata, HandlerError>;
}

impl std::fmt::Debug for dyn Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Transform")
    }
}

/// A rule predicate evaluated against a single metadata value.
pub trait Predicate: Send + Sync {
    fn evaluate(&self, value: &MetaValue, args: &RuleArgs) -> Result<bool, HandlerError>;
}

type TransformFactory = Box<dyn Fn() -> Box<dyn Transform> + Send + Sync>;

/// A named table of plugin symbols.
pub struct PluginModule {
    name: String,
    transforms: HashMap<String, TransformFactory>,
    predicates: HashMap<String, Arc<dyn Predicate>>,
}

impl PluginModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transforms: HashMap::new(),
            predicates: HashMap::new(),
        }
    }

    pub fn transform(
        mut self,
        symbol: impl Into<String>,
        factory: impl Fn() -> Box<dyn Transform> + Send + Sync + 'static,
    ) -> Self {
        self.transforms.insert(symbol.into(), Box::new(factory));
        self
    }

    pub fn predicate(mut self, symbol: impl Into<String>, predicate: Arc<dyn Predicate>) -> Self {
        self.predicates.insert(symbol.into(), predicate);
        self
    }
}

/// Resolves identifiers to handlers, searching user-registered modules
/// first and the built-in namespace last.
pub struct PluginRegistry {
    modules: Vec<PluginModule>,
}

impl PluginRegistry {
    /// Registry containing only the built-in modules.
    pub fn with_builtins() -> Self {
        Self {
            modules: builtins::modules(),
        }
    }

    /// Register a module ahead of everything registered so far.
    #[allow(dead_code)]
    pub fn register(&mut self, module: PluginModule) {
        self.modules.insert(0, module);
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m.name == name)
    }

    fn split_identifier(id: &str) -> Result<(&str, &str), PluginError> {
        let mut parts = id.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(module), Some(symbol), None) if !module.is_empty() && !symbol.is_empty() => {
                Ok((module, symbol))
            }
            _ => Err(PluginError::MalformedIdentifier(id.to_string())),
        }
    }

    fn find_module(&self, name: &str) -> Result<&PluginModule, PluginError> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| PluginError::ModuleNotFound(name.to_string()))
    }

    /// Resolve a transform identifier to a fresh handler instance.
    pub fn resolve_transform(&self, id: &str) -> Result<Box<dyn Transform>, PluginError> {
        let (module_name, symbol) = Self::split_identifier(id)?;
        let module = self.find_module(module_name)?;
        if let Some(factory) = module.transforms.get(symbol) {
            return Ok(factory());
        }
        if module.predicates.contains_key(symbol) {
            return Err(PluginError::WrongKind {
                id: id.to_string(),
                expected: "transform",
            });
        }
        Err(PluginError::SymbolNotFound {
            module: module_name.to_string(),
            symbol: symbol.to_string(),
        })
    }

    /// Resolve a predicate identifier. Predicates are stateless and shared.
    pub fn resolve_predicate(&self, id: &str) -> Result<Arc<dyn Predicate>, PluginError> {
        let (module_name, symbol) = Self::split_identifier(id)?;
        let module = self.find_module(module_name)?;
        if let Some(predicate) = module.predicates.get(symbol) {
            return Ok(Arc::clone(predicate));
        }
        if module.transforms.contains_key(symbol) {
            return Err(PluginError::WrongKind {
                id: id.to_string(),
                expected: "predicate",
            });
        }
        Err(PluginError::SymbolNotFound {
            module: module_name.to_string(),
            symbol: symbol.to_string(),
        })
    }
}
