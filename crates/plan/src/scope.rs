//! Nestable name resolvers. A scope maps a (qualifier, column-name) pair
//! onto the attribute that produces it; scope chains are pure data and
//! resolution is read-only.

use std::sync::{Arc, Mutex};

use crate::{Attribute, AttributeId};

#[derive(Debug, Clone)]
pub enum Resolution {
    Column(Attribute),
    Ambiguous(String),
    NotFound,
}

pub trait Scope: std::fmt::Debug {
    fn resolve(&self, qualifier: Option<&str>, name: &str) -> Resolution;
}

/// Scopes are shared, immutable data.
pub type ScopeRef = Arc<dyn Scope + Send + Sync>;

/// Explicit bindings: the columns of one relation, resolvable without a
/// qualifier.
#[derive(Debug, Default)]
pub struct RegisteredScope {
    bindings: Vec<Attribute>,
}

impl RegisteredScope {
    pub fn new(bindings: Vec<Attribute>) -> Self {
        RegisteredScope { bindings }
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.bindings
    }
}

impl Scope for RegisteredScope {
    fn resolve(&self, qualifier: Option<&str>, name: &str) -> Resolution {
        if qualifier.is_some() {
            return Resolution::NotFound;
        }
        let mut matches = self
            .bindings
            .iter()
            .filter(|attribute| attribute.name.eq_ignore_ascii_case(name));
        match (matches.next(), matches.next()) {
            (Some(attribute), None) => Resolution::Column(attribute.clone()),
            (Some(_), Some(_)) => Resolution::Ambiguous(name.to_string()),
            (None, _) => Resolution::NotFound,
        }
    }
}

/// Rewrites qualified lookups under an alias: `alias.x` resolves as `x`
/// against the inner scope; unqualified lookups pass through.
#[derive(Debug)]
pub struct AliasedScope {
    alias: String,
    inner: Arc<dyn Scope + Send + Sync>,
}

impl AliasedScope {
    pub fn new(alias: impl Into<String>, inner: Arc<dyn Scope + Send + Sync>) -> Self {
        AliasedScope {
            alias: alias.into(),
            inner,
        }
    }
}

impl Scope for AliasedScope {
    fn resolve(&self, qualifier: Option<&str>, name: &str) -> Resolution {
        match qualifier {
            Some(qualifier) if qualifier.eq_ignore_ascii_case(&self.alias) => {
                self.inner.resolve(None, name)
            }
            Some(_) => Resolution::NotFound,
            None => self.inner.resolve(None, name),
        }
    }
}

/// An ordered cascade of scopes: the first match wins.
#[derive(Debug, Default)]
pub struct MultiScope {
    scopes: Vec<Arc<dyn Scope + Send + Sync>>,
}

impl MultiScope {
    pub fn new(scopes: Vec<Arc<dyn Scope + Send + Sync>>) -> Self {
        MultiScope { scopes }
    }

    pub fn push(&mut self, scope: Arc<dyn Scope + Send + Sync>) {
        self.scopes.push(scope);
    }
}

impl Scope for MultiScope {
    fn resolve(&self, qualifier: Option<&str>, name: &str) -> Resolution {
        for scope in &self.scopes {
            match scope.resolve(qualifier, name) {
                Resolution::NotFound => continue,
                hit => return hit,
            }
        }
        Resolution::NotFound
    }
}

/// Database-wide resolution: tables through the catalog and callables
/// through the function registry. The root of every lookup chain; it
/// never resolves columns, so as a [`Scope`] it always misses.
#[derive(Debug)]
pub struct GlobalScope<'a> {
    catalog: &'a catalog::Catalog,
    defaults: &'a catalog::SchemaDefaults,
    functions: &'a crate::FunctionRegistry,
}

impl<'a> GlobalScope<'a> {
    pub fn new(
        catalog: &'a catalog::Catalog,
        defaults: &'a catalog::SchemaDefaults,
        functions: &'a crate::FunctionRegistry,
    ) -> Self {
        GlobalScope {
            catalog,
            defaults,
            functions,
        }
    }

    /// Resolve a table name, applying the default schema when the
    /// reference is unqualified.
    pub fn resolve_table(
        &self,
        schema_name: Option<&str>,
        name: &str,
    ) -> Option<Arc<catalog::TableSchema>> {
        let schema_name = schema_name.unwrap_or(&self.defaults.schema_name);
        self.catalog.resolve(schema_name, name)
    }

    pub fn scalar_function(&self, name: &str) -> Option<Arc<crate::ScalarFunction>> {
        self.functions.scalar(name)
    }

    pub fn aggregate_function(&self, name: &str) -> Option<Arc<crate::AggregateFunction>> {
        self.functions.aggregate(name)
    }

    pub fn table_function(&self, name: &str) -> Option<Arc<crate::TableFunction>> {
        self.functions.table(name)
    }
}

impl Scope for GlobalScope<'_> {
    fn resolve(&self, _qualifier: Option<&str>, _name: &str) -> Resolution {
        Resolution::NotFound
    }
}

/// A build-time instrument wrapping an outer scope: it resolves like the
/// inner scope but records every hit, which is how a subquery learns its
/// correlation set.
#[derive(Debug)]
pub struct CorrelationTracker {
    inner: Arc<dyn Scope + Send + Sync>,
    hits: Mutex<Vec<Attribute>>,
}

impl CorrelationTracker {
    pub fn new(inner: Arc<dyn Scope + Send + Sync>) -> Self {
        CorrelationTracker {
            inner,
            hits: Mutex::new(Vec::new()),
        }
    }

    pub fn correlated(&self) -> Vec<AttributeId> {
        self.hits.lock().expect("tracker poisoned").iter().map(|a| a.id).collect()
    }
}

impl Scope for CorrelationTracker {
    fn resolve(&self, qualifier: Option<&str>, name: &str) -> Resolution {
        let resolution = self.inner.resolve(qualifier, name);
        if let Resolution::Column(attribute) = &resolution {
            let mut hits = self.hits.lock().expect("tracker poisoned");
            if !hits.iter().any(|a| a.id == attribute.id) {
                hits.push(attribute.clone());
            }
        }
        resolution
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ScalarTy;

    fn attribute(id: u32, name: &str) -> Attribute {
        Attribute {
            id: AttributeId(id),
            name: name.to_string(),
            ty: ScalarTy::default(),
        }
    }

    #[test]
    fn test_registered_scope_ambiguity() {
        let scope = RegisteredScope::new(vec![attribute(1, "a"), attribute(2, "a")]);
        assert!(matches!(scope.resolve(None, "a"), Resolution::Ambiguous(_)));
        assert!(matches!(scope.resolve(None, "b"), Resolution::NotFound));
    }

    #[test]
    fn test_aliased_scope_rewrites_qualifier() {
        let inner = Arc::new(RegisteredScope::new(vec![attribute(1, "x")]));
        let scope = AliasedScope::new("t", inner);

        assert!(matches!(scope.resolve(Some("t"), "x"), Resolution::Column(_)));
        assert!(matches!(scope.resolve(Some("u"), "x"), Resolution::NotFound));
        assert!(matches!(scope.resolve(None, "x"), Resolution::Column(_)));
    }

    #[test]
    fn test_multi_scope_first_match_wins() {
        let first = Arc::new(RegisteredScope::new(vec![attribute(1, "x")]));
        let second = Arc::new(RegisteredScope::new(vec![attribute(2, "x")]));
        let scope = MultiScope::new(vec![first, second]);

        match scope.resolve(None, "x") {
            Resolution::Column(attribute) => assert_eq!(attribute.id, AttributeId(1)),
            other => panic!("expected a column, got {other:?}"),
        }
    }

    #[test]
    fn test_correlation_tracker_records_hits() {
        let inner = Arc::new(RegisteredScope::new(vec![attribute(7, "outer")]));
        let tracker = CorrelationTracker::new(inner);

        assert!(matches!(
            tracker.resolve(None, "outer"),
            Resolution::Column(_)
        ));
        tracker.resolve(None, "outer");
        assert_eq!(tracker.correlated(), vec![AttributeId(7)]);
    }
}
