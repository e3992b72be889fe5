//! The capabilities of the sources a statement pattern is evaluated against.

mod memory;
#[cfg(feature = "http-client")]
mod sparql;

use crate::endpoint::EndpointId;
use crate::error::EvaluationError;
use crate::filter::FilterExpr;
use crate::model::{BindingSet, BindingSetIter};
use crate::pattern::StatementPattern;
pub use memory::MemoryTripleSource;
#[cfg(feature = "http-client")]
pub use sparql::SparqlTripleSource;
use spareval::CancellationToken;
use std::error::Error;

/// Access to the statements of one federation member.
///
/// Each endpoint owns exactly one triple source for the lifetime of its connection.
/// Implementations hold their own connection handle and must be usable from multiple threads at once:
/// the federation evaluates a statement pattern against all the sources in parallel.
///
/// The binding sets returned by [`evaluate_prepared`](Self::evaluate_prepared) and [`statements`](Self::statements)
/// must extend the given `bindings` with the values of the pattern variables.
/// If a `filter` is given, only the binding sets it accepts must be returned.
pub trait TripleSource: Send + Sync {
    /// The source error.
    type Error: Error + Send + Sync + 'static;

    /// If this source is better queried with a SPARQL query string than with a pattern scan
    fn uses_prepared_query(&self) -> bool;

    /// Evaluates a SPARQL `SELECT` query built by [`QueryStringBuilder`](crate::QueryStringBuilder).
    ///
    /// `cancellation` is the token of the federated query, the evaluation should stop once it is cancelled.
    fn evaluate_prepared(
        &self,
        query: &str,
        bindings: &BindingSet,
        filter: Option<&FilterExpr>,
        cancellation: &CancellationToken,
    ) -> Result<BindingSetIter, Self::Error>;

    /// Returns the binding sets matching the statement pattern
    fn statements(
        &self,
        pattern: &StatementPattern,
        bindings: &BindingSet,
        filter: Option<&FilterExpr>,
    ) -> Result<BindingSetIter, Self::Error>;

    /// Returns if at least one statement matches the pattern
    fn has_statements(
        &self,
        pattern: &StatementPattern,
        bindings: &BindingSet,
    ) -> Result<bool, Self::Error>;
}

/// Only keeps the binding sets accepted by the filter
pub(crate) fn apply_filter(iter: BindingSetIter, filter: Option<&FilterExpr>) -> BindingSetIter {
    if let Some(filter) = filter {
        let filter = filter.clone();
        iter.filter_results(move |bindings| filter.evaluate(bindings))
    } else {
        iter
    }
}

/// Converts the errors of a [`TripleSource`] into [`EvaluationError`]s attributed to its endpoint
pub(crate) struct ErrorConversionTripleSource<S> {
    endpoint: EndpointId,
    inner: S,
}

impl<S: TripleSource> ErrorConversionTripleSource<S> {
    pub(crate) fn new(endpoint: EndpointId, inner: S) -> Self {
        Self { endpoint, inner }
    }

    fn wrap(&self, error: S::Error) -> EvaluationError {
        EvaluationError::source(self.endpoint.clone(), error)
    }

    /// Errors raised while iterating are attributed to the endpoint too
    fn attribute(&self, iter: BindingSetIter) -> BindingSetIter {
        let endpoint = self.endpoint.clone();
        BindingSetIter::new(iter.map(move |result| {
            result.map_err(|e| match e {
                EvaluationError::Unexpected(source) => EvaluationError::Source {
                    endpoint: endpoint.clone(),
                    source,
                },
                e => e,
            })
        }))
    }
}

impl<S: TripleSource> TripleSource for ErrorConversionTripleSource<S> {
    type Error = EvaluationError;

    #[inline]
    fn uses_prepared_query(&self) -> bool {
        self.inner.uses_prepared_query()
    }

    fn evaluate_prepared(
        &self,
        query: &str,
        bindings: &BindingSet,
        filter: Option<&FilterExpr>,
        cancellation: &CancellationToken,
    ) -> Result<BindingSetIter, EvaluationError> {
        Ok(self.attribute(
            self.inner
                .evaluate_prepared(query, bindings, filter, cancellation)
                .map_err(|e| self.wrap(e))?,
        ))
    }

    fn statements(
        &self,
        pattern: &StatementPattern,
        bindings: &BindingSet,
        filter: Option<&FilterExpr>,
    ) -> Result<BindingSetIter, EvaluationError> {
        Ok(self.attribute(
            self.inner
                .statements(pattern, bindings, filter)
                .map_err(|e| self.wrap(e))?,
        ))
    }

    fn has_statements(
        &self,
        pattern: &StatementPattern,
        bindings: &BindingSet,
    ) -> Result<bool, EvaluationError> {
        self.inner
            .has_statements(pattern, bindings)
            .map_err(|e| self.wrap(e))
    }
}
