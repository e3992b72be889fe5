use crate::error::EvaluationError;
use crate::filter::FilterExpr;
use crate::model::{BindingSet, BindingSetIter};
use crate::pattern::StatementPattern;
use crate::query_string::{QueryStringBuilder, SelectQuery};
use crate::source::{TripleSource, apply_filter};
use oxhttp::model::header::{ACCEPT, CONTENT_TYPE};
use oxhttp::model::{Body, Method, Request};
use sparesults::{QueryResultsFormat, QueryResultsParser, ReaderQueryResultsParserOutput};
use spareval::CancellationToken;
use std::error::Error;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

const RESULTS_MEDIA_TYPES: &str = "application/sparql-results+json, application/sparql-results+xml, text/tab-separated-values;q=0.8";

/// A [`TripleSource`] querying a remote server through the [SPARQL 1.1 protocol](https://www.w3.org/TR/sparql11-protocol/).
///
/// Queries are sent with `POST` requests.
#[derive(Clone)]
pub struct SparqlTripleSource {
    endpoint: Arc<str>,
    client: Arc<oxhttp::Client>,
}

impl SparqlTripleSource {
    pub fn new(
        endpoint: impl Into<Arc<str>>,
        timeout: Option<Duration>,
        redirection_limit: usize,
    ) -> io::Result<Self> {
        let mut client = oxhttp::Client::new()
            .with_redirection_limit(redirection_limit)
            .with_user_agent(concat!("sparfed/", env!("CARGO_PKG_VERSION")))
            .map_err(invalid_input_error)?;
        if let Some(timeout) = timeout {
            client = client.with_global_timeout(timeout);
        }
        Ok(Self {
            endpoint: endpoint.into(),
            client: Arc::new(client),
        })
    }

    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post(&self, query: &str) -> io::Result<(String, Body)> {
        trace!(endpoint = %self.endpoint, query, "sending SPARQL query");
        let request = Request::builder()
            .method(Method::POST)
            .uri(&*self.endpoint)
            .header(ACCEPT, RESULTS_MEDIA_TYPES)
            .header(CONTENT_TYPE, "application/sparql-query")
            .body(query.as_bytes().to_vec())
            .map_err(invalid_input_error)?;
        let response = self.client.request(request)?;
        let status = response.status();
        if !status.is_success() {
            return Err(io::Error::other(format!(
                "Error {} returned by {} with payload:\n{}",
                status,
                self.endpoint,
                response.into_body().to_string()?
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .ok_or_else(|| {
                invalid_data_error(format!("No Content-Type returned by {}", self.endpoint))
            })?
            .to_str()
            .map_err(invalid_data_error)?
            .to_owned();
        Ok((content_type, response.into_body()))
    }

    fn query(&self, query: &str) -> Result<ReaderQueryResultsParserOutput<Body>, EvaluationError> {
        let (content_type, body) = self.post(query).map_err(unexpected)?;
        let format = QueryResultsFormat::from_media_type(&content_type).ok_or_else(|| {
            unexpected(format!(
                "Unsupported Content-Type returned by {}: {content_type}",
                self.endpoint
            ))
        })?;
        QueryResultsParser::from_format(format)
            .for_reader(body)
            .map_err(unexpected)
    }

    fn select(
        &self,
        query: &str,
        bindings: &BindingSet,
        filter: Option<&FilterExpr>,
    ) -> Result<BindingSetIter, EvaluationError> {
        let ReaderQueryResultsParserOutput::Solutions(solutions) = self.query(query)? else {
            return Err(unexpected(format!(
                "No SPARQL solutions returned by {}",
                self.endpoint
            )));
        };
        let bindings = bindings.clone();
        let results = solutions.filter_map(move |solution| match solution {
            Ok(solution) => bindings.merge(&solution.into()).map(Ok),
            Err(e) => Some(Err(unexpected(e))),
        });
        Ok(apply_filter(BindingSetIter::new(results), filter))
    }
}

impl TripleSource for SparqlTripleSource {
    type Error = EvaluationError;

    #[inline]
    fn uses_prepared_query(&self) -> bool {
        true
    }

    fn evaluate_prepared(
        &self,
        query: &str,
        bindings: &BindingSet,
        filter: Option<&FilterExpr>,
        cancellation: &CancellationToken,
    ) -> Result<BindingSetIter, EvaluationError> {
        if cancellation.is_cancelled() {
            return Err(EvaluationError::Cancelled);
        }
        self.select(query, bindings, filter)
    }

    fn statements(
        &self,
        pattern: &StatementPattern,
        bindings: &BindingSet,
        filter: Option<&FilterExpr>,
    ) -> Result<BindingSetIter, EvaluationError> {
        match QueryStringBuilder::select(pattern, bindings, filter)? {
            SelectQuery::Select {
                query,
                filter_evaluated,
            } => self.select(
                &query,
                bindings,
                if filter_evaluated { None } else { filter },
            ),
            SelectQuery::FullyBound => {
                if let Some(filter) = filter {
                    if !filter.evaluate(bindings)? {
                        return Ok(BindingSetIter::empty());
                    }
                }
                Ok(if self.has_statements(pattern, bindings)? {
                    BindingSetIter::single(bindings.clone())
                } else {
                    BindingSetIter::empty()
                })
            }
        }
    }

    fn has_statements(
        &self,
        pattern: &StatementPattern,
        bindings: &BindingSet,
    ) -> Result<bool, EvaluationError> {
        let ReaderQueryResultsParserOutput::Boolean(value) =
            self.query(&QueryStringBuilder::ask(pattern, bindings)?)?
        else {
            return Err(unexpected(format!(
                "No boolean returned by {} for an ASK query",
                self.endpoint
            )));
        };
        Ok(value)
    }
}

fn unexpected(error: impl Into<Box<dyn Error + Send + Sync>>) -> EvaluationError {
    EvaluationError::Unexpected(error.into())
}

fn invalid_data_error(error: impl Into<Box<dyn Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

fn invalid_input_error(error: impl Into<Box<dyn Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, error)
}
