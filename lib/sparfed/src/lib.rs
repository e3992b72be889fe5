#![doc = include_str!("../README.md")]
#![doc(test(attr(deny(warnings))))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![doc(html_favicon_url = "https://raw.githubusercontent.com/oxigraph/oxigraph/main/logo.svg")]
#![doc(html_logo_url = "https://raw.githubusercontent.com/oxigraph/oxigraph/main/logo.svg")]

pub mod config;
mod context;
mod endpoint;
mod error;
mod evaluator;
mod filter;
mod model;
mod pattern;
mod query_string;
mod source;
mod union;

pub use crate::config::{ConfigError, FederationConfig};
pub use crate::context::{
    DEFAULT_UNION_BUFFER, FederationContext, FederationManager, FederationOptions,
};
pub use crate::endpoint::{Endpoint, EndpointId, EndpointKind, EndpointManager, EndpointRegistry};
pub use crate::error::{EvaluationError, MalformedQueryError};
pub use crate::evaluator::StatementSourcePattern;
pub use crate::filter::FilterExpr;
pub use crate::model::{BindingSet, BindingSetIter, VariableName};
pub use crate::pattern::{
    BoundPattern, PatternSlot, QueryId, QueryInfo, StatementPattern, StatementSource,
    StatementSourceKind,
};
pub use crate::query_string::{QueryStringBuilder, SelectQuery};
pub use crate::source::MemoryTripleSource;
#[cfg(feature = "http-client")]
pub use crate::source::SparqlTripleSource;
pub use crate::source::TripleSource;
pub use crate::union::{ConcurrentUnion, UnionBuilder, UnionHandle, UnionState, UnionTask};
pub use spareval::CancellationToken;
