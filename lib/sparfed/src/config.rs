//! JSON configuration of a federation.
//!
//! ```json
//! {
//!   "worker_threads": 4,
//!   "union_buffer": 1024,
//!   "http": { "timeout_secs": 60, "redirection_limit": 5 },
//!   "endpoints": [
//!     { "type": "sparql", "id": "dbpedia", "url": "https://dbpedia.org/sparql" },
//!     { "type": "memory", "id": "local", "location": "data.nt", "prefer_prepared_query": false }
//!   ]
//! }
//! ```
//!
//! Relative `location`s are resolved against the directory of the configuration file.

use crate::context::{DEFAULT_UNION_BUFFER, FederationManager, FederationOptions};
use crate::endpoint::{Endpoint, EndpointKind, EndpointManager};
use crate::error::EvaluationError;
use crate::source::MemoryTripleSource;
use oxiri::{Iri, IriParseError};
use oxrdfio::{RdfFormat, RdfParseError};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(feature = "http-client")]
use std::time::Duration;
use std::{fs, io};
use tracing::info;

const DEFAULT_REDIRECTION_LIMIT: usize = 5;

/// The configuration of a [`FederationManager`] and of its endpoints
#[derive(Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(deny_unknown_fields)]
pub struct FederationConfig {
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default = "default_union_buffer")]
    pub union_buffer: usize,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

/// Options of the HTTP client used by the SPARQL endpoints
#[derive(Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_redirection_limit")]
    pub redirection_limit: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            redirection_limit: DEFAULT_REDIRECTION_LIMIT,
        }
    }
}

/// A federation member
#[derive(Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum EndpointConfig {
    /// A server implementing the SPARQL 1.1 protocol
    Sparql {
        id: String,
        #[serde(default)]
        name: Option<String>,
        url: String,
    },
    /// An RDF file loaded in memory
    Memory {
        id: String,
        #[serde(default)]
        name: Option<String>,
        location: PathBuf,
        /// File extension or media type, guessed from the location by default
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        prefer_prepared_query: bool,
    },
}

impl EndpointConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::Sparql { id, .. } | Self::Memory { id, .. } => id,
        }
    }
}

fn default_union_buffer() -> usize {
    DEFAULT_UNION_BUFFER
}

fn default_redirection_limit() -> usize {
    DEFAULT_REDIRECTION_LIMIT
}

impl FederationConfig {
    /// Reads a configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut config = Self::from_slice(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Parses a configuration, relative locations are resolved against the working directory
    pub fn from_slice(content: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(content)?)
    }

    pub fn options(&self) -> FederationOptions {
        FederationOptions {
            worker_threads: self.worker_threads,
            union_buffer: self.union_buffer,
        }
    }

    /// Connects to or loads all the configured endpoints
    pub fn build_registry(&self) -> Result<EndpointManager, ConfigError> {
        let registry = EndpointManager::new();
        let mut ids = HashSet::new();
        for endpoint in &self.endpoints {
            if !ids.insert(endpoint.id()) {
                return Err(ConfigError::DuplicateEndpoint(endpoint.id().into()));
            }
            registry.add_endpoint(self.build_endpoint(endpoint)?);
        }
        Ok(registry)
    }

    /// Builds the [`FederationManager`] of the configured endpoints
    pub fn build(&self) -> Result<FederationManager, ConfigError> {
        Ok(FederationManager::new(
            Arc::new(self.build_registry()?),
            self.options(),
        )?)
    }

    fn build_endpoint(&self, config: &EndpointConfig) -> Result<Endpoint, ConfigError> {
        let endpoint = match config {
            EndpointConfig::Sparql { id, url, .. } => {
                let url = Iri::parse(url.clone())
                    .map_err(|source| ConfigError::InvalidUrl {
                        url: url.clone(),
                        source,
                    })?
                    .into_inner();
                self.build_sparql_endpoint(id, &url)?
            }
            EndpointConfig::Memory {
                id,
                location,
                format,
                prefer_prepared_query,
                ..
            } => {
                let path = match &self.base_dir {
                    Some(base_dir) if location.is_relative() => base_dir.join(location),
                    _ => location.clone(),
                };
                let format = if let Some(format) = format {
                    rdf_format_from_name(format)
                } else {
                    path.extension()
                        .and_then(|e| e.to_str())
                        .and_then(RdfFormat::from_extension)
                }
                .ok_or_else(|| ConfigError::UnknownFormat(path.clone()))?;
                let file = File::open(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                let source = MemoryTripleSource::from_reader(format, BufReader::new(file))
                    .map_err(|source| ConfigError::Parse {
                        path: path.clone(),
                        source,
                    })?
                    .with_prepared_query(*prefer_prepared_query);
                info!(endpoint = %id, path = %path.display(), quads = source.dataset().len(), "file loaded");
                Endpoint::new(
                    id.as_str(),
                    EndpointKind::NativeStore,
                    path.display().to_string(),
                    source,
                )
            }
        };
        Ok(match config {
            EndpointConfig::Sparql {
                name: Some(name), ..
            }
            | EndpointConfig::Memory {
                name: Some(name), ..
            } => endpoint.with_name(name),
            _ => endpoint,
        })
    }

    #[cfg(feature = "http-client")]
    fn build_sparql_endpoint(&self, id: &str, url: &str) -> Result<Endpoint, ConfigError> {
        let source = crate::source::SparqlTripleSource::new(
            url,
            self.http.timeout_secs.map(Duration::from_secs),
            self.http.redirection_limit,
        )
        .map_err(|source| ConfigError::Io {
            path: PathBuf::from(url),
            source,
        })?;
        Ok(Endpoint::new(id, EndpointKind::SparqlEndpoint, url, source))
    }

    #[cfg(not(feature = "http-client"))]
    #[expect(clippy::unused_self)]
    fn build_sparql_endpoint(&self, id: &str, _url: &str) -> Result<Endpoint, ConfigError> {
        Err(ConfigError::HttpClientDisabled(id.into()))
    }
}

fn rdf_format_from_name(name: &str) -> Option<RdfFormat> {
    RdfFormat::from_extension(name).or_else(|| RdfFormat::from_media_type(name))
}

/// An error in the federation configuration
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Error while reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Error while parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: RdfParseError,
    },
    #[error("Invalid endpoint URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: IriParseError,
    },
    #[error("The RDF format of {} is unknown", .0.display())]
    UnknownFormat(PathBuf),
    #[error("The endpoint id {0} is used multiple times")]
    DuplicateEndpoint(String),
    #[error("The endpoint {0} is a SPARQL endpoint but the HTTP client is disabled")]
    HttpClientDisabled(String),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

#[cfg(test)]
#[expect(clippy::panic_in_result_fn)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointRegistry;
    use std::error::Error;
    use std::io::Write;

    #[test]
    fn defaults() -> Result<(), Box<dyn Error>> {
        let config = FederationConfig::from_slice(b"{}")?;
        assert_eq!(config.options(), FederationOptions::default());
        assert_eq!(config.http, HttpConfig::default());
        assert!(config.endpoints.is_empty());
        Ok(())
    }

    #[test]
    fn endpoints_are_parsed() -> Result<(), Box<dyn Error>> {
        let config = FederationConfig::from_slice(
            br#"{
                "worker_threads": 2,
                "union_buffer": 16,
                "http": { "timeout_secs": 10 },
                "endpoints": [
                    { "type": "sparql", "id": "remote", "url": "http://example.com/sparql" },
                    { "type": "memory", "id": "local", "name": "Local data", "location": "data.ttl", "prefer_prepared_query": true }
                ]
            }"#,
        )?;
        assert_eq!(config.worker_threads, Some(2));
        assert_eq!(config.union_buffer, 16);
        assert_eq!(config.http.timeout_secs, Some(10));
        assert_eq!(config.http.redirection_limit, 5);
        assert_eq!(
            config.endpoints,
            [
                EndpointConfig::Sparql {
                    id: "remote".into(),
                    name: None,
                    url: "http://example.com/sparql".into()
                },
                EndpointConfig::Memory {
                    id: "local".into(),
                    name: Some("Local data".into()),
                    location: "data.ttl".into(),
                    format: None,
                    prefer_prepared_query: true
                }
            ]
        );
        Ok(())
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            FederationConfig::from_slice(br#"{"workers": 2}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            FederationConfig::from_slice(
                br#"{"endpoints": [{"type": "ftp", "id": "a", "url": "ftp://example.com"}]}"#
            ),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn memory_endpoint_is_loaded_relative_to_config() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join("data.nt"),
            "<http://example.com/s> <http://example.com/p> <http://example.com/o> .\n",
        )?;
        let mut config_file = File::create(dir.path().join("config.json"))?;
        config_file.write_all(
            br#"{"endpoints": [{"type": "memory", "id": "local", "location": "data.nt"}]}"#,
        )?;
        drop(config_file);
        let registry =
            FederationConfig::from_path(dir.path().join("config.json"))?.build_registry()?;
        let endpoint = registry.resolve(&"local".into())?;
        assert_eq!(endpoint.kind(), EndpointKind::NativeStore);
        assert!(!endpoint.triple_source().uses_prepared_query());
        Ok(())
    }

    #[test]
    fn duplicate_ids_are_rejected() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let data = dir.path().join("data.nt");
        fs::write(&data, "")?;
        let config = FederationConfig::from_slice(
            format!(
                r#"{{"endpoints": [
                    {{"type": "memory", "id": "a", "location": {0}}},
                    {{"type": "memory", "id": "a", "location": {0}}}
                ]}}"#,
                serde_json::to_string(&data)?
            )
            .as_bytes(),
        )?;
        assert!(matches!(
            config.build_registry(),
            Err(ConfigError::DuplicateEndpoint(id)) if id == "a"
        ));
        Ok(())
    }

    #[test]
    fn missing_file_and_unknown_format() -> Result<(), Box<dyn Error>> {
        let config = FederationConfig::from_slice(
            br#"{"endpoints": [{"type": "memory", "id": "a", "location": "/nonexistent/data.nt"}]}"#,
        )?;
        assert!(matches!(config.build(), Err(ConfigError::Io { .. })));
        let config = FederationConfig::from_slice(
            br#"{"endpoints": [{"type": "memory", "id": "a", "location": "data.unknown"}]}"#,
        )?;
        assert!(matches!(
            config.build_registry(),
            Err(ConfigError::UnknownFormat(_))
        ));
        Ok(())
    }

    #[test]
    fn invalid_url_is_rejected() -> Result<(), Box<dyn Error>> {
        let config = FederationConfig::from_slice(
            br#"{"endpoints": [{"type": "sparql", "id": "a", "url": "not a url"}]}"#,
        )?;
        assert!(matches!(
            config.build_registry(),
            Err(ConfigError::InvalidUrl { .. })
        ));
        Ok(())
    }
}
