use std::fmt;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use log::debug;

use crate::Result;
use crate::data::value::Value;
use crate::tpl::ast::Statement;
use crate::tpl::lexer::Token;
use crate::tpl::parser::{ArgParser, Parser};
use crate::{filters, tags};

/// Outcome of a filter call. The error is a plain message; the executor adds the
/// filter name and source position.
pub type FilterResult = std::result::Result<Value, String>;

/// A named value transform: `(input, raw string arguments) -> output`.
pub type FilterFn = dyn Fn(&Value, &[String]) -> FilterResult + Send + Sync;

/// Parse-function of a custom tag.
///
/// It receives the general parser (to parse nested bodies with
/// [`Parser::parse_block`]), the tag's `{%` token and a sub-parser bounded to the
/// tag's own arguments, which it must consume completely.
pub type TagParseFn =
    dyn Fn(&mut Parser<'_>, &Token, &mut ArgParser<'_>) -> Result<Arc<dyn Statement>> + Send + Sync;

/// The shared default registry, pre-loaded with the built-in filters and tags.
///
/// Register extensions during start-up, before templates are rendered concurrently.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::with_builtins);

/// Catalogue of filters and tags consulted by the parser (tags) and the executor (filters).
///
/// Lookups may run from any number of threads at once; registration takes a write lock
/// on the affected shard. The last registration for a name wins.
pub struct Registry {
    filters: DashMap<String, Arc<FilterFn>>,
    tags: DashMap<String, Arc<TagParseFn>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("filters", &self.filter_names())
            .field("tags", &self.tag_names())
            .finish()
    }
}

impl Registry {
    /// Creates a registry with no filters and no tags.
    pub fn new() -> Self {
        Self {
            filters: DashMap::new(),
            tags: DashMap::new(),
        }
    }

    /// Creates a registry holding the built-in filters and tags.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        filters::register_builtins(&registry);
        tags::register_builtins(&registry);
        registry
    }

    pub fn register_filter<F>(&self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Value, &[String]) -> FilterResult + Send + Sync + 'static,
    {
        let name = name.into();
        let replaced = self.filters.insert(name.clone(), Arc::new(filter)).is_some();
        debug!("Register filter: name={}, replaced={}", name, replaced);
    }

    pub fn register_tag<F>(&self, name: impl Into<String>, parse_fn: F)
    where
        F: Fn(&mut Parser<'_>, &Token, &mut ArgParser<'_>) -> Result<Arc<dyn Statement>>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let replaced = self.tags.insert(name.clone(), Arc::new(parse_fn)).is_some();
        debug!("Register tag: name={}, replaced={}", name, replaced);
    }

    /// Returns the filter registered under `name`.
    ///
    /// The `Arc` is cloned out so no shard lock is held while the filter runs.
    pub fn filter(&self, name: &str) -> Option<Arc<FilterFn>> {
        self.filters.get(name).map(|f| f.value().clone())
    }

    /// Returns the tag parse-function registered under `name`.
    pub fn tag(&self, name: &str) -> Option<Arc<TagParseFn>> {
        self.tags.get(name).map(|t| t.value().clone())
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn unregister_filter(&self, name: &str) -> bool {
        self.filters.remove(name).is_some()
    }

    pub fn unregister_tag(&self, name: &str) -> bool {
        self.tags.remove(name).is_some()
    }

    /// Sorted names of all registered filters.
    pub fn filter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.filters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Sorted names of all registered tags.
    pub fn tag_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tags.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Registers a filter in the shared [`REGISTRY`].
pub fn register_filter<F>(name: impl Into<String>, filter: F)
where
    F: Fn(&Value, &[String]) -> FilterResult + Send + Sync + 'static,
{
    REGISTRY.register_filter(name, filter);
}

/// Registers a tag in the shared [`REGISTRY`].
pub fn register_tag<F>(name: impl Into<String>, parse_fn: F)
where
    F: Fn(&mut Parser<'_>, &Token, &mut ArgParser<'_>) -> Result<Arc<dyn Statement>>
        + Send
        + Sync
        + 'static,
{
    REGISTRY.register_tag(name, parse_fn);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_registration_wins() {
        let registry = Registry::new();
        registry.register_filter("pick", |_, _| Ok(Value::I64(1)));
        registry.register_filter("pick", |_, _| Ok(Value::I64(2)));

        let pick = registry.filter("pick").unwrap();
        assert_eq!(pick(&Value::Null, &[]), Ok(Value::I64(2)));
        assert_eq!(registry.filter_names(), vec!["pick".to_string()]);
    }

    #[test]
    fn test_unregister() {
        let registry = Registry::new();
        registry.register_filter("x", |v, _| Ok(v.clone()));
        assert!(registry.has_filter("x"));
        assert!(registry.unregister_filter("x"));
        assert!(!registry.has_filter("x"));
        assert!(registry.filter("x").is_none());
        assert!(!registry.unregister_filter("x"));
    }

    #[test]
    fn test_builtins() {
        let registry = Registry::with_builtins();
        for name in ["upper", "lower", "capitalize", "default", "join", "date"] {
            assert!(registry.has_filter(name), "missing filter {}", name);
        }
        assert!(registry.has_tag("set"));
        assert!(registry.has_tag("with"));
        assert!(Registry::new().filter_names().is_empty());
    }

    #[test]
    fn test_builtin_names_can_be_replaced() {
        let registry = Registry::with_builtins();
        registry.register_filter("upper", |_, _| Ok(Value::Str("shadowed".into())));
        let upper = registry.filter("upper").unwrap();
        assert_eq!(
            upper(&Value::Str("a".into()), &[]),
            Ok(Value::Str("shadowed".into()))
        );
    }
}
