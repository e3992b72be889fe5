use crate::error::EvaluationError;
use crate::source::{ErrorConversionTripleSource, TripleSource};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Identifier of a federation member
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct EndpointId(Arc<str>);

impl EndpointId {
    #[inline]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EndpointId {
    #[inline]
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EndpointId {
    #[inline]
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for EndpointId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind of a federation member
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EndpointKind {
    /// A remote server implementing the SPARQL protocol
    SparqlEndpoint,
    /// A store whose statements are directly accessible
    NativeStore,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SparqlEndpoint => "sparql-endpoint",
            Self::NativeStore => "native-store",
        })
    }
}

/// A member of the federation and its access capability
pub struct Endpoint {
    id: EndpointId,
    name: String,
    location: String,
    kind: EndpointKind,
    triple_source: Arc<dyn TripleSource<Error = EvaluationError>>,
}

impl Endpoint {
    pub fn new(
        id: impl Into<EndpointId>,
        kind: EndpointKind,
        location: impl Into<String>,
        triple_source: impl TripleSource + 'static,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            location: location.into(),
            kind,
            triple_source: Arc::new(ErrorConversionTripleSource::new(id.clone(), triple_source)),
            id,
        }
    }

    /// Sets a human readable name, the identifier is used by default
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[inline]
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The URL or the file path the endpoint data comes from
    #[inline]
    pub fn location(&self) -> &str {
        &self.location
    }

    #[inline]
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// The capability used to evaluate statement patterns against this endpoint
    #[inline]
    pub fn triple_source(&self) -> &Arc<dyn TripleSource<Error = EvaluationError>> {
        &self.triple_source
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("location", &self.location)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Maps endpoint identifiers to live endpoints
pub trait EndpointRegistry: Send + Sync {
    /// Returns the endpoint with the given identifier.
    ///
    /// Fails with [`EvaluationError::EndpointNotFound`] if the identifier is not known (anymore).
    fn resolve(&self, id: &EndpointId) -> Result<Arc<Endpoint>, EvaluationError>;
}

/// In-memory [`EndpointRegistry`].
///
/// ```
/// use sparfed::{Endpoint, EndpointKind, EndpointManager, EndpointRegistry, MemoryTripleSource};
///
/// let manager = EndpointManager::new();
/// manager.add_endpoint(Endpoint::new(
///     "local",
///     EndpointKind::NativeStore,
///     "memory",
///     MemoryTripleSource::default(),
/// ));
/// assert_eq!(manager.resolve(&"local".into())?.kind(), EndpointKind::NativeStore);
/// assert!(manager.resolve(&"other".into()).is_err());
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
#[derive(Default)]
pub struct EndpointManager {
    endpoints: RwLock<HashMap<EndpointId, Arc<Endpoint>>>,
}

impl EndpointManager {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint, replacing any endpoint with the same identifier.
    ///
    /// Returns the replaced endpoint if any.
    pub fn add_endpoint(&self, endpoint: Endpoint) -> Option<Arc<Endpoint>> {
        debug!(endpoint = %endpoint.id, kind = %endpoint.kind, "registering endpoint");
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.id.clone(), Arc::new(endpoint))
    }

    /// Unregisters an endpoint.
    ///
    /// Statement sources still referencing it will fail with [`EvaluationError::EndpointNotFound`].
    pub fn remove_endpoint(&self, id: &EndpointId) -> Option<Arc<Endpoint>> {
        debug!(endpoint = %id, "removing endpoint");
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// All the registered endpoints, sorted by identifier
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut endpoints = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        endpoints
    }
}

impl EndpointRegistry for EndpointManager {
    fn resolve(&self, id: &EndpointId) -> Result<Arc<Endpoint>, EvaluationError> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| EvaluationError::EndpointNotFound(id.clone()))
    }
}
