use crate::endpoint::EndpointId;
use crate::model::BindingSet;
use oxrdf::{Term, Variable};
use spargebra::term::{NamedNodePattern, TermPattern, TriplePattern};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a federated query execution
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct QueryId(u64);

impl QueryId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// The identity of the query a statement pattern belongs to
#[derive(Clone, Debug)]
pub struct QueryInfo {
    id: QueryId,
    query: Arc<str>,
}

impl QueryInfo {
    pub fn new(query: impl Into<Arc<str>>) -> Self {
        Self {
            id: QueryId::next(),
            query: query.into(),
        }
    }

    #[inline]
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// The original text of the query
    #[inline]
    pub fn query(&self) -> &str {
        &self.query
    }
}

/// A triple pattern to evaluate against the federation.
///
/// Blank nodes inside the pattern behave like variables that are never returned.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct StatementPattern {
    pattern: TriplePattern,
}

impl StatementPattern {
    #[inline]
    pub fn new(pattern: TriplePattern) -> Self {
        Self { pattern }
    }

    #[inline]
    pub fn triple_pattern(&self) -> &TriplePattern {
        &self.pattern
    }

    /// The variables of the pattern in subject, predicate, object order, without duplicates
    pub fn variables(&self) -> Vec<&Variable> {
        let mut variables = Vec::with_capacity(3);
        for variable in [
            term_pattern_variable(&self.pattern.subject),
            named_node_pattern_variable(&self.pattern.predicate),
            term_pattern_variable(&self.pattern.object),
        ]
        .into_iter()
        .flatten()
        {
            if !variables.contains(&variable) {
                variables.push(variable);
            }
        }
        variables
    }

    /// The variables of the pattern that are not bound by the given binding set
    pub fn free_variables(&self, bindings: &BindingSet) -> Vec<&Variable> {
        self.variables()
            .into_iter()
            .filter(|v| !bindings.contains(*v))
            .collect()
    }

    /// Returns if all the variables of the pattern are bound by the given binding set
    #[inline]
    pub fn is_fully_bound(&self, bindings: &BindingSet) -> bool {
        self.free_variables(bindings).is_empty()
    }

    /// Returns the pattern with the bound variables replaced by their value
    pub fn substitute(&self, bindings: &BindingSet) -> BoundPattern {
        BoundPattern {
            subject: PatternSlot::from_term_pattern(&self.pattern.subject, bindings),
            predicate: PatternSlot::from_named_node_pattern(&self.pattern.predicate, bindings),
            object: PatternSlot::from_term_pattern(&self.pattern.object, bindings),
        }
    }
}

impl From<TriplePattern> for StatementPattern {
    #[inline]
    fn from(pattern: TriplePattern) -> Self {
        Self::new(pattern)
    }
}

impl fmt::Display for StatementPattern {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.pattern.fmt(f)
    }
}

fn term_pattern_variable(pattern: &TermPattern) -> Option<&Variable> {
    if let TermPattern::Variable(variable) = pattern {
        Some(variable)
    } else {
        None
    }
}

fn named_node_pattern_variable(pattern: &NamedNodePattern) -> Option<&Variable> {
    if let NamedNodePattern::Variable(variable) = pattern {
        Some(variable)
    } else {
        None
    }
}

/// A triple pattern after substitution of the incoming bindings
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BoundPattern {
    pub subject: PatternSlot,
    pub predicate: PatternSlot,
    pub object: PatternSlot,
}

impl BoundPattern {
    /// Matches a triple against the pattern and returns the new bindings it implies.
    ///
    /// Returns `None` if the triple does not match, for example if a variable used twice gets two different values.
    pub fn match_triple(&self, subject: &Term, predicate: &Term, object: &Term) -> Option<BindingSet> {
        let mut new_bindings: Vec<(Variable, Term)> = Vec::new();
        for (slot, value) in [
            (&self.subject, subject),
            (&self.predicate, predicate),
            (&self.object, object),
        ] {
            match slot {
                PatternSlot::Bound(term) => {
                    if term != value {
                        return None;
                    }
                }
                PatternSlot::Free(variable) => {
                    if let Some((_, previous)) = new_bindings.iter().find(|(v, _)| v == variable) {
                        if previous != value {
                            return None;
                        }
                    } else {
                        new_bindings.push((variable.clone(), value.clone()));
                    }
                }
                PatternSlot::Anonymous => (),
            }
        }
        Some(new_bindings.into_iter().collect())
    }
}

/// A position of a [`BoundPattern`]
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PatternSlot {
    /// A constant or a variable bound by the incoming bindings
    Bound(Term),
    /// A variable still to bind
    Free(Variable),
    /// A blank node of the pattern: matches anything and binds nothing
    Anonymous,
}

impl PatternSlot {
    fn from_term_pattern(pattern: &TermPattern, bindings: &BindingSet) -> Self {
        match pattern {
            TermPattern::NamedNode(node) => Self::Bound(node.clone().into()),
            TermPattern::Literal(literal) => Self::Bound(literal.clone().into()),
            TermPattern::Variable(variable) => Self::from_variable(variable, bindings),
            // Blank nodes and quoted triple patterns are not constrained
            _ => Self::Anonymous,
        }
    }

    fn from_named_node_pattern(pattern: &NamedNodePattern, bindings: &BindingSet) -> Self {
        match pattern {
            NamedNodePattern::NamedNode(node) => Self::Bound(node.clone().into()),
            NamedNodePattern::Variable(variable) => Self::from_variable(variable, bindings),
        }
    }

    fn from_variable(variable: &Variable, bindings: &BindingSet) -> Self {
        if let Some(value) = bindings.get(variable) {
            Self::Bound(value.clone())
        } else {
            Self::Free(variable.clone())
        }
    }

    #[inline]
    pub fn bound(&self) -> Option<&Term> {
        if let Self::Bound(term) = self {
            Some(term)
        } else {
            None
        }
    }
}

/// The kind of a statement source, as decided by source selection
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StatementSourceKind {
    /// The data is owned by the federation itself
    Local,
    /// The endpoint is known to contain matching statements
    Remote,
    /// The endpoint might contain matching statements
    RemotePossibly,
}

/// An endpoint that may produce matches for a statement pattern
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct StatementSource {
    endpoint_id: EndpointId,
    kind: StatementSourceKind,
}

impl StatementSource {
    #[inline]
    pub fn new(endpoint_id: impl Into<EndpointId>, kind: StatementSourceKind) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            kind,
        }
    }

    #[inline]
    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    #[inline]
    pub fn kind(&self) -> StatementSourceKind {
        self.kind
    }
}
