use crate::context::FederationContext;
use crate::endpoint::EndpointId;
use crate::error::EvaluationError;
use crate::filter::FilterExpr;
use crate::model::{BindingSet, BindingSetIter};
use crate::pattern::{StatementPattern, StatementSource};
use crate::query_string::{QueryStringBuilder, SelectQuery};
use crate::source::TripleSource;
use crate::union::UnionTask;
use spareval::CancellationToken;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

type SharedTripleSource = Arc<dyn TripleSource<Error = EvaluationError>>;

/// A statement pattern annotated with the sources that may contain matching statements.
///
/// The pattern is evaluated against all its sources at the same time and the results are merged in a single stream.
///
/// ```
/// use oxrdf::{Dataset, GraphName, NamedNode, Quad, Variable};
/// use sparfed::{
///     BindingSet, Endpoint, EndpointKind, EndpointManager, FederationManager, FederationOptions,
///     MemoryTripleSource, StatementPattern, StatementSource, StatementSourceKind,
///     StatementSourcePattern,
/// };
/// use spargebra::term::TriplePattern;
/// use std::sync::Arc;
///
/// let ex = NamedNode::new("http://example.com")?;
/// let endpoints = EndpointManager::new();
/// endpoints.add_endpoint(Endpoint::new(
///     "local",
///     EndpointKind::NativeStore,
///     "memory",
///     MemoryTripleSource::new(Dataset::from_iter([Quad::new(
///         ex.clone(),
///         ex.clone(),
///         ex.clone(),
///         GraphName::DefaultGraph,
///     )])),
/// ));
/// let manager = FederationManager::new(Arc::new(endpoints), FederationOptions::default())?;
///
/// let pattern = StatementSourcePattern::new(
///     StatementPattern::new(TriplePattern {
///         subject: Variable::new("s")?.into(),
///         predicate: ex.clone().into(),
///         object: ex.clone().into(),
///     }),
///     [StatementSource::new("local", StatementSourceKind::Local)],
/// );
/// let results = pattern
///     .evaluate(&manager.begin_query("SELECT * WHERE { ?s ?s ?s }"), &BindingSet::new())?
///     .collect::<Result<Vec<_>, _>>()?;
/// assert_eq!(results, [BindingSet::new().with(Variable::new("s")?, ex)]);
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
#[derive(Clone)]
pub struct StatementSourcePattern {
    pattern: StatementPattern,
    sources: Vec<StatementSource>,
    filter: Option<FilterExpr>,
}

impl StatementSourcePattern {
    pub fn new(
        pattern: StatementPattern,
        sources: impl IntoIterator<Item = StatementSource>,
    ) -> Self {
        let mut result = Self {
            pattern,
            sources: Vec::new(),
            filter: None,
        };
        for source in sources {
            result.add_statement_source(source);
        }
        result
    }

    /// Attaches a filter the results must satisfy
    #[must_use]
    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Adds a source, returns `false` if a source for the same endpoint is already there
    pub fn add_statement_source(&mut self, source: StatementSource) -> bool {
        if self
            .sources
            .iter()
            .any(|s| s.endpoint_id() == source.endpoint_id())
        {
            return false;
        }
        self.sources.push(source);
        true
    }

    #[inline]
    pub fn pattern(&self) -> &StatementPattern {
        &self.pattern
    }

    #[inline]
    pub fn sources(&self) -> &[StatementSource] {
        &self.sources
    }

    #[inline]
    pub fn filter(&self) -> Option<&FilterExpr> {
        self.filter.as_ref()
    }

    /// Evaluates the pattern against all its sources
    pub fn evaluate(
        &self,
        context: &FederationContext,
        bindings: &BindingSet,
    ) -> Result<BindingSetIter, EvaluationError> {
        self.evaluate_with_sources(context, &self.sources, bindings)
    }

    /// Evaluates the pattern against the given sources.
    ///
    /// Sources preferring prepared queries all get the same query text, built once.
    /// Other sources are scanned.
    /// If the bindings leave no variable free, whatever the source strategies,
    /// the sources are only asked if the statement exists: the result is then the given bindings or nothing.
    pub fn evaluate_with_sources(
        &self,
        context: &FederationContext,
        sources: &[StatementSource],
        bindings: &BindingSet,
    ) -> Result<BindingSetIter, EvaluationError> {
        if context.is_cancelled() {
            return Err(EvaluationError::Cancelled);
        }
        if sources.is_empty() {
            return Ok(BindingSetIter::empty());
        }
        if self.pattern.is_fully_bound(bindings) {
            debug!(query = %context.query_id(), pattern = %self.pattern, "pattern fully bound, checking existence");
            return self.check_statement_sources(context, sources, bindings);
        }
        let mut prepared_query: Option<(Arc<str>, bool)> = None;
        let mut union = context.create_union();
        for source in sources {
            let endpoint = context.registry().resolve(source.endpoint_id())?;
            let triple_source = Arc::clone(endpoint.triple_source());
            if triple_source.uses_prepared_query() {
                let (query, filter_evaluated) = if let Some(prepared) = &prepared_query {
                    prepared.clone()
                } else {
                    match QueryStringBuilder::select(&self.pattern, bindings, self.filter.as_ref())?
                    {
                        SelectQuery::Select {
                            query,
                            filter_evaluated,
                        } => {
                            debug!(query = %context.query_id(), pattern = %self.pattern, filter_evaluated, "prepared query built");
                            prepared_query.insert((query, filter_evaluated)).clone()
                        }
                        SelectQuery::FullyBound => {
                            return self.check_statement_sources(context, sources, bindings);
                        }
                    }
                };
                union.add_task(PreparedQueryTask {
                    endpoint: endpoint.id().clone(),
                    source: triple_source,
                    query,
                    bindings: bindings.clone(),
                    cancellation: context.cancellation_token().clone(),
                    filter: if filter_evaluated {
                        None
                    } else {
                        self.filter.clone()
                    },
                });
            } else {
                union.add_task(ScanTask {
                    endpoint: endpoint.id().clone(),
                    source: triple_source,
                    pattern: self.pattern.clone(),
                    bindings: bindings.clone(),
                    filter: self.filter.clone(),
                });
            }
        }
        Ok(union.build().into())
    }

    /// Asks the sources in order if the fully bound pattern exists, stops at the first one that has it
    fn check_statement_sources(
        &self,
        context: &FederationContext,
        sources: &[StatementSource],
        bindings: &BindingSet,
    ) -> Result<BindingSetIter, EvaluationError> {
        if let Some(filter) = &self.filter {
            if !filter.evaluate(bindings)? {
                return Ok(BindingSetIter::empty());
            }
        }
        for source in sources {
            if context.is_cancelled() {
                return Err(EvaluationError::Cancelled);
            }
            let endpoint = context.registry().resolve(source.endpoint_id())?;
            if endpoint
                .triple_source()
                .has_statements(&self.pattern, bindings)?
            {
                trace!(query = %context.query_id(), endpoint = %endpoint.id(), "statement found");
                return Ok(BindingSetIter::single(bindings.clone()));
            }
        }
        Ok(BindingSetIter::empty())
    }
}

impl fmt::Debug for StatementSourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementSourcePattern")
            .field("pattern", &self.pattern.to_string())
            .field("sources", &self.sources)
            .field("filter", &self.filter)
            .finish()
    }
}

/// Evaluates the shared prepared query against one source
struct PreparedQueryTask {
    endpoint: EndpointId,
    source: SharedTripleSource,
    query: Arc<str>,
    bindings: BindingSet,
    cancellation: CancellationToken,
    filter: Option<FilterExpr>,
}

impl UnionTask for PreparedQueryTask {
    fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    fn evaluate(self) -> Result<BindingSetIter, EvaluationError> {
        self.source.evaluate_prepared(
            &self.query,
            &self.bindings,
            self.filter.as_ref(),
            &self.cancellation,
        )
    }
}

/// Scans one source for the pattern
struct ScanTask {
    endpoint: EndpointId,
    source: SharedTripleSource,
    pattern: StatementPattern,
    bindings: BindingSet,
    filter: Option<FilterExpr>,
}

impl UnionTask for ScanTask {
    fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    fn evaluate(self) -> Result<BindingSetIter, EvaluationError> {
        self.source
            .statements(&self.pattern, &self.bindings, self.filter.as_ref())
    }
}
