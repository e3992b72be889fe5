use crate::error::{EvaluationError, MalformedQueryError};
use crate::filter::FilterExpr;
use crate::model::{BindingSet, BindingSetIter};
use crate::pattern::StatementPattern;
use crate::source::{TripleSource, apply_filter};
use oxrdf::{Dataset, GraphNameRef, Term, TermRef};
use oxrdfio::{RdfFormat, RdfParseError, RdfParser};
use spareval::{CancellationToken, QueryEvaluationError, QueryEvaluator, QueryResults};
use spargebra::SparqlParser;
use std::io::Read;
use std::sync::Arc;

/// A [`TripleSource`] over the default graph of an in-memory [`Dataset`].
///
/// Patterns are evaluated by scanning the dataset unless [`with_prepared_query`](Self::with_prepared_query) is set,
/// in which case the queries are evaluated with [`spareval`].
///
/// ```
/// use oxrdf::{Dataset, GraphName, NamedNode, Quad, Variable};
/// use sparfed::{BindingSet, MemoryTripleSource, StatementPattern, TripleSource};
/// use spargebra::term::TriplePattern;
///
/// let ex = NamedNode::new("http://example.com")?;
/// let source = MemoryTripleSource::new(Dataset::from_iter([Quad::new(
///     ex.clone(),
///     ex.clone(),
///     ex.clone(),
///     GraphName::DefaultGraph,
/// )]));
/// let pattern = StatementPattern::new(TriplePattern {
///     subject: Variable::new("s")?.into(),
///     predicate: ex.clone().into(),
///     object: ex.clone().into(),
/// });
/// let results = source
///     .statements(&pattern, &BindingSet::new(), None)?
///     .collect::<Result<Vec<_>, _>>()?;
/// assert_eq!(results, [BindingSet::new().with(Variable::new("s")?, ex)]);
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
#[derive(Clone, Default)]
pub struct MemoryTripleSource {
    dataset: Arc<Dataset>,
    default_graph: Arc<[[Term; 3]]>,
    prefer_prepared_query: bool,
}

impl MemoryTripleSource {
    pub fn new(dataset: Dataset) -> Self {
        let default_graph = dataset
            .quads_for_graph_name(GraphNameRef::DefaultGraph)
            .map(|quad| {
                [
                    TermRef::from(quad.subject).into_owned(),
                    TermRef::from(quad.predicate).into_owned(),
                    quad.object.into_owned(),
                ]
            })
            .collect();
        Self {
            dataset: Arc::new(dataset),
            default_graph,
            prefer_prepared_query: false,
        }
    }

    /// Loads an RDF file, blank nodes are renamed to avoid collisions between files
    pub fn from_reader(format: RdfFormat, reader: impl Read) -> Result<Self, RdfParseError> {
        let mut dataset = Dataset::new();
        for quad in RdfParser::from_format(format)
            .rename_blank_nodes()
            .for_reader(reader)
        {
            dataset.insert(&quad?);
        }
        Ok(Self::new(dataset))
    }

    /// Evaluates the patterns with SPARQL queries instead of scans
    #[must_use]
    pub fn with_prepared_query(mut self, prefer_prepared_query: bool) -> Self {
        self.prefer_prepared_query = prefer_prepared_query;
        self
    }

    #[inline]
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Lazily scans the default graph, the returned iterator owns a reference to it
    fn scan(
        &self,
        pattern: &StatementPattern,
        bindings: &BindingSet,
    ) -> impl Iterator<Item = BindingSet> + Send + use<> {
        let pattern = pattern.substitute(bindings);
        let bindings = bindings.clone();
        let triples = Arc::clone(&self.default_graph);
        (0..triples.len()).filter_map(move |i| {
            let [subject, predicate, object] = triples.get(i)?;
            bindings.merge(&pattern.match_triple(subject, predicate, object)?)
        })
    }
}

impl TripleSource for MemoryTripleSource {
    type Error = EvaluationError;

    #[inline]
    fn uses_prepared_query(&self) -> bool {
        self.prefer_prepared_query
    }

    fn evaluate_prepared(
        &self,
        query: &str,
        bindings: &BindingSet,
        filter: Option<&FilterExpr>,
        cancellation: &CancellationToken,
    ) -> Result<BindingSetIter, EvaluationError> {
        let query = SparqlParser::new()
            .parse_query(query)
            .map_err(MalformedQueryError::from)?;
        let QueryResults::Solutions(solutions) = QueryEvaluator::new()
            .with_cancellation_token(cancellation.clone())
            .execute(&*self.dataset, &query)
            .map_err(evaluation_error)?
        else {
            return Err(EvaluationError::Unexpected(
                "Only SELECT queries can be evaluated by a triple source".into(),
            ));
        };
        // The dataset is borrowed by the solutions: they are materialized
        let mut results = Vec::new();
        for solution in solutions {
            if let Some(row) = bindings.merge(&solution.map_err(evaluation_error)?.into()) {
                results.push(Ok(row));
            }
        }
        Ok(apply_filter(BindingSetIter::new(results), filter))
    }

    fn statements(
        &self,
        pattern: &StatementPattern,
        bindings: &BindingSet,
        filter: Option<&FilterExpr>,
    ) -> Result<BindingSetIter, EvaluationError> {
        Ok(apply_filter(
            BindingSetIter::new(self.scan(pattern, bindings).map(Ok)),
            filter,
        ))
    }

    fn has_statements(
        &self,
        pattern: &StatementPattern,
        bindings: &BindingSet,
    ) -> Result<bool, EvaluationError> {
        let pattern = pattern.substitute(bindings);
        Ok(self
            .default_graph
            .iter()
            .any(|[subject, predicate, object]| {
                pattern.match_triple(subject, predicate, object).is_some()
            }))
    }
}

fn evaluation_error(error: QueryEvaluationError) -> EvaluationError {
    match error {
        QueryEvaluationError::Cancelled => EvaluationError::Cancelled,
        e => EvaluationError::Unexpected(Box::new(e)),
    }
}
