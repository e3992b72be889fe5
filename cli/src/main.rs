use anyhow::{Context, bail, ensure};
use clap::{Parser, Subcommand, ValueEnum, ValueHint};
use oxrdf::{Term, Variable};
use sparesults::{QueryResultsFormat, QueryResultsSerializer};
use sparfed::{
    BindingSet, EndpointId, EndpointKind, EndpointManager, EndpointRegistry, FederationConfig,
    FederationManager, FilterExpr, StatementPattern, StatementSource, StatementSourceKind,
    StatementSourcePattern,
};
use spargebra::algebra::{Expression, GraphPattern};
use spargebra::term::TriplePattern;
use spargebra::{Query, SparqlParser};
use std::io::{self, Write, stdout};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(about, version, name = "sparfed")]
/// Evaluates SPARQL triple patterns against a federation of endpoints.
struct Args {
    /// Format of the logs written to stderr.
    ///
    /// The log level is set with the RUST_LOG environment variable.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluates a triple pattern against the federation and writes the results to stdout.
    Evaluate {
        /// JSON file describing the federation endpoints.
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        config: PathBuf,
        /// The triple pattern in SPARQL syntax, like "?s <http://xmlns.com/foaf/0.1/knows> ?o".
        #[arg(short, long)]
        pattern: String,
        /// A SPARQL filter expression the results must satisfy, like "?s != ?o".
        #[arg(long)]
        filter: Option<String>,
        /// Binds a variable before the evaluation, like "s=<http://example.com/alice>".
        ///
        /// The value is written in N-Triples syntax.
        #[arg(short, long = "bind", value_name = "VARIABLE=TERM")]
        bindings: Vec<String>,
        /// Identifier of an endpoint to query.
        ///
        /// By default all the configured endpoints are queried.
        #[arg(short, long = "source", value_name = "ENDPOINT")]
        sources: Vec<String>,
        /// Format of the results.
        ///
        /// Can be an extension like "json" or a MIME type like "application/sparql-results+json".
        #[arg(short, long, default_value = "json")]
        format: String,
    },
    /// Lists the configured endpoints.
    Endpoints {
        /// JSON file describing the federation endpoints.
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        config: PathBuf,
    },
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);
    match args.command {
        Command::Evaluate {
            config,
            pattern,
            filter,
            bindings,
            sources,
            format,
        } => {
            let format = results_format_from_name(&format)?;
            let (query, pattern, filter) = parse_pattern(&pattern, filter.as_deref())?;
            let bindings = bindings
                .iter()
                .map(|b| parse_binding(b))
                .collect::<anyhow::Result<BindingSet>>()?;
            let config = load_config(&config)?;
            let registry = Arc::new(config.build_registry()?);
            let sources = select_sources(&registry, sources)?;
            let manager = FederationManager::new(
                Arc::clone(&registry) as Arc<dyn EndpointRegistry>,
                config.options(),
            )?;
            let mut variables = pattern
                .variables()
                .into_iter()
                .cloned()
                .collect::<Vec<_>>();
            for variable in bindings.variables() {
                if !variables.contains(variable) {
                    variables.push(variable.clone());
                }
            }
            let mut pattern = StatementSourcePattern::new(pattern, sources);
            if let Some(filter) = filter {
                pattern = pattern.with_filter(FilterExpr::new(filter)?);
            }
            let context = manager.begin_query(query);
            info!(query = %context.query_id(), sources = pattern.sources().len(), "evaluating pattern");
            let results = pattern.evaluate(&context, &bindings)?;
            let mut writer = QueryResultsSerializer::from_format(format)
                .serialize_solutions_to_writer(stdout().lock(), variables)?;
            let mut count = 0_usize;
            for result in results {
                let result = result?;
                writer.serialize(result.iter())?;
                count += 1;
            }
            writer.finish()?.flush()?;
            info!(query = %context.query_id(), count, "evaluation done");
            Ok(())
        }
        Command::Endpoints { config } => {
            let registry = load_config(&config)?.build_registry()?;
            let mut out = stdout().lock();
            for endpoint in registry.endpoints() {
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}",
                    endpoint.id(),
                    endpoint.kind(),
                    if endpoint.triple_source().uses_prepared_query() {
                        "prepared-query"
                    } else {
                        "scan"
                    },
                    endpoint.name(),
                    endpoint.location()
                )?;
            }
            out.flush()?;
            Ok(())
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<FederationConfig> {
    FederationConfig::from_path(path)
        .with_context(|| format!("Failed to load the configuration {}", path.display()))
}

fn select_sources(
    registry: &EndpointManager,
    ids: Vec<String>,
) -> anyhow::Result<Vec<StatementSource>> {
    if ids.is_empty() {
        return Ok(registry
            .endpoints()
            .iter()
            .map(|e| StatementSource::new(e.id().clone(), source_kind(e.kind())))
            .collect());
    }
    ids.into_iter()
        .map(|id| {
            let endpoint = registry.resolve(&EndpointId::from(id))?;
            Ok(StatementSource::new(
                endpoint.id().clone(),
                source_kind(endpoint.kind()),
            ))
        })
        .collect()
}

fn source_kind(kind: EndpointKind) -> StatementSourceKind {
    match kind {
        EndpointKind::NativeStore => StatementSourceKind::Local,
        EndpointKind::SparqlEndpoint => StatementSourceKind::Remote,
    }
}

/// Parses the pattern and the filter, returns them with the query text they are part of
fn parse_pattern(
    pattern: &str,
    filter: Option<&str>,
) -> anyhow::Result<(String, StatementPattern, Option<Expression>)> {
    let query = if let Some(filter) = filter {
        format!("SELECT * WHERE {{ {pattern} FILTER({filter}) }}")
    } else {
        format!("SELECT * WHERE {{ {pattern} }}")
    };
    let Query::Select {
        pattern: graph_pattern,
        ..
    } = SparqlParser::new()
        .parse_query(&query)
        .with_context(|| format!("Invalid triple pattern: {pattern}"))?
    else {
        bail!("Only SELECT queries are supported")
    };
    let mut triples = Vec::new();
    let mut filters = Vec::new();
    collect_pattern(&graph_pattern, &mut triples, &mut filters)?;
    ensure!(
        triples.len() == 1,
        "Exactly one triple pattern is expected, found {}",
        triples.len()
    );
    let filter = filters
        .into_iter()
        .reduce(|a, b| Expression::And(Box::new(a), Box::new(b)));
    debug!(query, "pattern parsed");
    Ok((query, triples.remove(0).into(), filter))
}

fn collect_pattern(
    pattern: &GraphPattern,
    triples: &mut Vec<TriplePattern>,
    filters: &mut Vec<Expression>,
) -> anyhow::Result<()> {
    match pattern {
        GraphPattern::Bgp { patterns } => triples.extend(patterns.iter().cloned()),
        GraphPattern::Project { inner, .. } => collect_pattern(inner, triples, filters)?,
        GraphPattern::Filter { expr, inner } => {
            filters.push(expr.clone());
            collect_pattern(inner, triples, filters)?;
        }
        _ => bail!("Only a triple pattern with an optional filter is supported, found {pattern}"),
    }
    Ok(())
}

fn parse_binding(binding: &str) -> anyhow::Result<(Variable, Term)> {
    let Some((variable, value)) = binding.split_once('=') else {
        bail!("Bindings must be written VARIABLE=TERM, found {binding}")
    };
    let variable = Variable::new(variable.trim().trim_start_matches(['?', '$']))
        .with_context(|| format!("Invalid variable name in {binding}"))?;
    let value = Term::from_str(value.trim())
        .with_context(|| format!("Invalid term in {binding}"))?;
    Ok((variable, value))
}

fn results_format_from_name(name: &str) -> anyhow::Result<QueryResultsFormat> {
    if let Some(t) = QueryResultsFormat::from_extension(name) {
        return Ok(t);
    }
    if let Some(t) = QueryResultsFormat::from_media_type(name) {
        return Ok(t);
    }
    bail!("The file format '{name}' is unknown")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic_in_result_fn)]

    use super::*;
    use anyhow::Result;
    use assert_cmd::Command;
    use assert_fs::TempDir;
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    const DATA_A: &str = "<http://example.com/alice> <http://xmlns.com/foaf/0.1/knows> <http://example.com/bob> .\n<http://example.com/bob> <http://xmlns.com/foaf/0.1/knows> <http://example.com/carol> .\n";
    const DATA_B: &str = "<http://example.com/alice> <http://xmlns.com/foaf/0.1/knows> <http://example.com/dave> .\n";

    fn cli_command() -> Result<Command> {
        Ok(Command::cargo_bin("sparfed")?)
    }

    fn federation() -> Result<TempDir> {
        let dir = TempDir::new()?;
        dir.child("a.nt").write_str(DATA_A)?;
        dir.child("b.ttl").write_str(DATA_B)?;
        dir.child("config.json").write_str(
            r#"{
                "worker_threads": 2,
                "endpoints": [
                    { "type": "memory", "id": "a", "location": "a.nt" },
                    { "type": "memory", "id": "b", "name": "Second", "location": "b.ttl", "prefer_prepared_query": true }
                ]
            }"#,
        )?;
        Ok(dir)
    }

    #[test]
    fn cli_help() -> Result<()> {
        cli_command()?
            .assert()
            .failure()
            .stdout("")
            .stderr(predicate::str::contains("Usage"));
        Ok(())
    }

    #[test]
    fn cli_endpoints() -> Result<()> {
        let dir = federation()?;
        cli_command()?
            .arg("endpoints")
            .arg("--config")
            .arg(dir.child("config.json").path())
            .assert()
            .success()
            .stdout(
                predicate::str::contains("a\tnative-store\tscan\ta\t")
                    .and(predicate::str::contains("b\tnative-store\tprepared-query\tSecond\t")),
            );
        Ok(())
    }

    #[test]
    fn cli_evaluate_all_sources() -> Result<()> {
        let dir = federation()?;
        cli_command()?
            .arg("evaluate")
            .arg("--config")
            .arg(dir.child("config.json").path())
            .arg("--pattern")
            .arg("?s <http://xmlns.com/foaf/0.1/knows> ?o")
            .arg("--bind")
            .arg("s=<http://example.com/alice>")
            .arg("--format")
            .arg("tsv")
            .assert()
            .success()
            .stdout(
                predicate::str::starts_with("?s\t?o\n")
                    .and(predicate::str::contains("<http://example.com/bob>"))
                    .and(predicate::str::contains("<http://example.com/dave>"))
                    .and(predicate::str::contains("<http://example.com/carol>").not()),
            );
        Ok(())
    }

    #[test]
    fn cli_evaluate_selected_source_with_filter() -> Result<()> {
        let dir = federation()?;
        cli_command()?
            .arg("evaluate")
            .arg("--config")
            .arg(dir.child("config.json").path())
            .arg("--pattern")
            .arg("?s <http://xmlns.com/foaf/0.1/knows> ?o")
            .arg("--filter")
            .arg("?o != <http://example.com/carol>")
            .arg("--source")
            .arg("a")
            .assert()
            .success()
            .stdout(
                predicate::str::contains("http://example.com/alice")
                    .and(predicate::str::contains("http://example.com/bob"))
                    .and(predicate::str::contains("http://example.com/carol").not())
                    .and(predicate::str::contains("http://example.com/dave").not()),
            );
        Ok(())
    }

    #[test]
    fn cli_evaluate_fully_bound_pattern() -> Result<()> {
        let dir = federation()?;
        cli_command()?
            .arg("evaluate")
            .arg("--config")
            .arg(dir.child("config.json").path())
            .arg("--pattern")
            .arg("<http://example.com/alice> <http://xmlns.com/foaf/0.1/knows> ?o")
            .arg("--bind")
            .arg("?o=<http://example.com/dave>")
            .arg("--format")
            .arg("csv")
            .assert()
            .success()
            .stdout("o\r\nhttp://example.com/dave\r\n");
        Ok(())
    }

    #[test]
    fn cli_evaluate_unknown_source() -> Result<()> {
        let dir = federation()?;
        cli_command()?
            .arg("evaluate")
            .arg("--config")
            .arg(dir.child("config.json").path())
            .arg("--pattern")
            .arg("?s ?p ?o")
            .arg("--source")
            .arg("removed")
            .assert()
            .failure()
            .stderr(predicate::str::contains("removed"));
        Ok(())
    }

    #[test]
    fn cli_evaluate_json_logs() -> Result<()> {
        let dir = federation()?;
        cli_command()?
            .env("RUST_LOG", "debug")
            .arg("--log-format")
            .arg("json")
            .arg("evaluate")
            .arg("--config")
            .arg(dir.child("config.json").path())
            .arg("--pattern")
            .arg("?s ?p ?o")
            .assert()
            .success()
            .stderr(predicate::str::contains("\"level\":\"INFO\""));
        Ok(())
    }

    #[test]
    fn pattern_parsing() -> Result<()> {
        let (query, pattern, filter) = parse_pattern("?s ?p \"a\"", Some("?s != ?p"))?;
        assert_eq!(query, "SELECT * WHERE { ?s ?p \"a\" FILTER(?s != ?p) }");
        assert_eq!(pattern.to_string(), "?s ?p \"a\"");
        assert!(filter.is_some());
        assert!(parse_pattern("?s ?p ?o . ?o ?p ?s", None).is_err());
        assert!(parse_pattern("?s ?p ?o } UNION { ?s ?p ?o", None).is_err());
        assert!(parse_pattern("?s ?p", None).is_err());
        Ok(())
    }

    #[test]
    fn binding_parsing() -> Result<()> {
        let (variable, value) = parse_binding("?s=<http://example.com/s>")?;
        assert_eq!(variable.as_str(), "s");
        assert_eq!(value.to_string(), "<http://example.com/s>");
        assert!(parse_binding("s").is_err());
        assert!(parse_binding("s=not a term").is_err());
        Ok(())
    }
}
