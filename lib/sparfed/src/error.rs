use crate::endpoint::EndpointId;
use oxrdf::{Term, Variable};
use spargebra::SparqlSyntaxError;
use std::convert::Infallible;
use std::error::Error;

/// An error raised while evaluating a statement pattern against a federation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EvaluationError {
    /// Connection or query execution fault raised by one of the sources
    #[error("Evaluation failed on endpoint {endpoint}: {source}")]
    Source {
        endpoint: EndpointId,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The query sent to the sources could not be built
    #[error(transparent)]
    MalformedQuery(#[from] MalformedQueryError),
    /// The endpoint identifier is not known by the registry anymore
    #[error("The endpoint {0} is not registered in the federation")]
    EndpointNotFound(EndpointId),
    /// The federated query has been cancelled
    #[error("The federated evaluation has been cancelled")]
    Cancelled,
    #[doc(hidden)]
    #[error(transparent)]
    Unexpected(Box<dyn Error + Send + Sync>),
}

impl EvaluationError {
    pub(crate) fn source(
        endpoint: EndpointId,
        error: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        let error = error.into();
        // Already attributed errors are kept as is
        match error.downcast::<Self>() {
            Ok(error) => match *error {
                Self::Unexpected(source) => Self::Source { endpoint, source },
                error => error,
            },
            Err(source) => Self::Source { endpoint, source },
        }
    }
}

impl From<Infallible> for EvaluationError {
    #[inline]
    fn from(error: Infallible) -> Self {
        match error {}
    }
}

/// The query text for a statement pattern could not be synthesized.
///
/// Note that a pattern without free variables is not an error: it is reported by
/// [`SelectQuery::FullyBound`](crate::SelectQuery::FullyBound).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MalformedQueryError {
    /// A literal would be used as a triple subject
    #[error("A literal can not be the subject of a triple pattern")]
    LiteralSubject,
    /// The predicate is bound to something else than an IRI
    #[error("{0} can not be used as a triple pattern predicate")]
    InvalidPredicate(Term),
    /// A variable is bound to a term that can not be written in a query, like a blank node
    #[error("The variable {variable} is bound to {value} that can not be sent to an endpoint")]
    UnsupportedValue { variable: Variable, value: Term },
    /// The filter uses a construction that can not be evaluated per binding set
    #[error("Unsupported filter expression: {0}")]
    UnsupportedFilter(String),
    /// The query text received by a source is not valid SPARQL
    #[error(transparent)]
    Syntax(#[from] SparqlSyntaxError),
}
