use crate::error::MalformedQueryError;
use crate::filter::FilterExpr;
use crate::model::BindingSet;
use crate::pattern::StatementPattern;
use oxrdf::{Term, Variable};
use spargebra::Query;
use spargebra::algebra::GraphPattern;
use spargebra::term::{NamedNodePattern, TermPattern, TriplePattern};
use std::sync::Arc;

/// Outcome of [`QueryStringBuilder::select`]
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SelectQuery {
    /// The query to send to the sources
    Select {
        query: Arc<str>,
        /// If the filter has been folded into the query and must not be evaluated again on the results
        filter_evaluated: bool,
    },
    /// All the pattern variables are already bound: there is nothing to select.
    ///
    /// The pattern must be evaluated as an existence check.
    FullyBound,
}

/// Writes the SPARQL queries sent to the sources that prefer prepared queries.
///
/// ```
/// use oxrdf::{NamedNode, Variable};
/// use sparfed::{BindingSet, QueryStringBuilder, SelectQuery, StatementPattern};
/// use spargebra::term::TriplePattern;
///
/// let pattern = StatementPattern::new(TriplePattern {
///     subject: Variable::new("s")?.into(),
///     predicate: NamedNode::new("http://example.com/p")?.into(),
///     object: Variable::new("o")?.into(),
/// });
/// let bindings = BindingSet::new().with(Variable::new("o")?, NamedNode::new("http://example.com/o")?);
/// let SelectQuery::Select { query, .. } = QueryStringBuilder::select(&pattern, &bindings, None)? else {
///     unreachable!()
/// };
/// assert_eq!(
///     &*query,
///     "SELECT ?s WHERE { ?s <http://example.com/p> <http://example.com/o> . }"
/// );
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
pub struct QueryStringBuilder;

impl QueryStringBuilder {
    /// Builds the `SELECT` query returning the values of the free variables of the pattern.
    ///
    /// The filter is folded into the query if the values it needs from `bindings` can be written in a `VALUES` clause.
    pub fn select(
        pattern: &StatementPattern,
        bindings: &BindingSet,
        filter: Option<&FilterExpr>,
    ) -> Result<SelectQuery, MalformedQueryError> {
        let projection = pattern
            .free_variables(bindings)
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        if projection.is_empty() {
            return Ok(SelectQuery::FullyBound);
        }
        let mut graph_pattern = GraphPattern::Bgp {
            patterns: vec![substitute(pattern.triple_pattern(), bindings)?],
        };
        let mut filter_evaluated = false;
        if let Some(filter) = filter {
            if let Some(values) = filter.ground_values(bindings) {
                if !values.is_empty() {
                    let (variables, row): (Vec<_>, Vec<_>) =
                        values.into_iter().map(|(v, t)| (v, Some(t))).unzip();
                    graph_pattern = GraphPattern::Join {
                        left: Box::new(GraphPattern::Values {
                            variables,
                            bindings: vec![row],
                        }),
                        right: Box::new(graph_pattern),
                    };
                }
                graph_pattern = GraphPattern::Filter {
                    expr: filter.expression().clone(),
                    inner: Box::new(graph_pattern),
                };
                filter_evaluated = true;
            }
        }
        let query = Query::Select {
            dataset: None,
            pattern: GraphPattern::Project {
                inner: Box::new(graph_pattern),
                variables: projection,
            },
            base_iri: None,
        };
        Ok(SelectQuery::Select {
            query: query.to_string().into(),
            filter_evaluated,
        })
    }

    /// Builds the `ASK` query checking if the pattern has at least one match
    pub fn ask(
        pattern: &StatementPattern,
        bindings: &BindingSet,
    ) -> Result<String, MalformedQueryError> {
        Ok(Query::Ask {
            dataset: None,
            pattern: GraphPattern::Bgp {
                patterns: vec![substitute(pattern.triple_pattern(), bindings)?],
            },
            base_iri: None,
        }
        .to_string())
    }
}

fn substitute(
    pattern: &TriplePattern,
    bindings: &BindingSet,
) -> Result<TriplePattern, MalformedQueryError> {
    let subject = substitute_term(&pattern.subject, bindings)?;
    if matches!(subject, TermPattern::Literal(_)) && matches!(pattern.subject, TermPattern::Variable(_)) {
        return Err(MalformedQueryError::LiteralSubject);
    }
    let predicate = match &pattern.predicate {
        NamedNodePattern::Variable(variable) => match bindings.get(variable) {
            Some(Term::NamedNode(node)) => node.clone().into(),
            Some(value) => return Err(MalformedQueryError::InvalidPredicate(value.clone())),
            None => variable.clone().into(),
        },
        NamedNodePattern::NamedNode(node) => node.clone().into(),
    };
    Ok(TriplePattern {
        subject,
        predicate,
        object: substitute_term(&pattern.object, bindings)?,
    })
}

fn substitute_term(
    pattern: &TermPattern,
    bindings: &BindingSet,
) -> Result<TermPattern, MalformedQueryError> {
    let TermPattern::Variable(variable) = pattern else {
        return Ok(pattern.clone());
    };
    match bindings.get(variable) {
        Some(Term::NamedNode(node)) => Ok(node.clone().into()),
        Some(Term::Literal(literal)) => Ok(literal.clone().into()),
        Some(value) => Err(unsupported_value(variable, value)),
        None => Ok(variable.clone().into()),
    }
}

fn unsupported_value(variable: &Variable, value: &Term) -> MalformedQueryError {
    MalformedQueryError::UnsupportedValue {
        variable: variable.clone(),
        value: value.clone(),
    }
}

#[cfg(test)]
#[expect(clippy::panic_in_result_fn)]
mod tests {
    use super::*;
    use oxrdf::{BlankNode, Literal, NamedNode};
    use spargebra::algebra::Expression;
    use std::error::Error;

    fn knows(subject: impl Into<TermPattern>, object: impl Into<TermPattern>) -> StatementPattern {
        StatementPattern::new(TriplePattern {
            subject: subject.into(),
            predicate: NamedNode::new_unchecked("http://xmlns.com/foaf/0.1/knows").into(),
            object: object.into(),
        })
    }

    #[test]
    fn select_projects_free_variables() -> Result<(), Box<dyn Error>> {
        let pattern = knows(Variable::new("s")?, Variable::new("o")?);
        assert_eq!(
            QueryStringBuilder::select(&pattern, &BindingSet::new(), None)?,
            SelectQuery::Select {
                query: "SELECT ?s ?o WHERE { ?s <http://xmlns.com/foaf/0.1/knows> ?o . }".into(),
                filter_evaluated: false,
            }
        );
        Ok(())
    }

    #[test]
    fn fully_bound_is_reported() -> Result<(), Box<dyn Error>> {
        let s = Variable::new("s")?;
        let pattern = knows(s.clone(), NamedNode::new("http://example.com/bob")?);
        let bindings = BindingSet::new().with(s, NamedNode::new("http://example.com/alice")?);
        assert_eq!(
            QueryStringBuilder::select(&pattern, &bindings, None)?,
            SelectQuery::FullyBound
        );
        let ask = QueryStringBuilder::ask(&pattern, &bindings)?;
        assert!(ask.starts_with("ASK"), "{ask}");
        assert!(
            ask.contains("<http://example.com/alice> <http://xmlns.com/foaf/0.1/knows> <http://example.com/bob> ."),
            "{ask}"
        );
        Ok(())
    }

    #[test]
    fn filter_is_folded_with_values() -> Result<(), Box<dyn Error>> {
        let s = Variable::new("s")?;
        let o = Variable::new("o")?;
        let pattern = knows(s.clone(), o.clone());
        let filter = FilterExpr::new(Expression::Not(Box::new(Expression::SameTerm(
            Box::new(s.clone().into()),
            Box::new(o.into()),
        ))))?;
        let bindings = BindingSet::new().with(s, NamedNode::new("http://example.com/alice")?);
        let SelectQuery::Select {
            query,
            filter_evaluated,
        } = QueryStringBuilder::select(&pattern, &bindings, Some(&filter))?
        else {
            return Err("the pattern is not fully bound".into());
        };
        assert!(filter_evaluated);
        assert!(query.starts_with("SELECT ?o WHERE {"), "{query}");
        assert!(query.contains("VALUES ( ?s )"), "{query}");
        assert!(query.contains("<http://example.com/alice>"), "{query}");
        assert!(query.contains("FILTER("), "{query}");
        Ok(())
    }

    #[test]
    fn filter_on_blank_node_stays_local() -> Result<(), Box<dyn Error>> {
        let s = Variable::new("s")?;
        let x = Variable::new("x")?;
        let pattern = knows(s, Variable::new("o")?);
        let filter = FilterExpr::new(Expression::FunctionCall(
            spargebra::algebra::Function::IsBlank,
            vec![x.clone().into()],
        ))?;
        let bindings = BindingSet::new().with(x, BlankNode::default());
        let SelectQuery::Select {
            query,
            filter_evaluated,
        } = QueryStringBuilder::select(&pattern, &bindings, Some(&filter))?
        else {
            return Err("the pattern is not fully bound".into());
        };
        assert!(!filter_evaluated);
        assert!(!query.contains("FILTER"), "{query}");
        Ok(())
    }

    #[test]
    fn malformed_bindings() -> Result<(), Box<dyn Error>> {
        let s = Variable::new("s")?;
        let o = Variable::new("o")?;
        let pattern = knows(s.clone(), o.clone());
        assert!(matches!(
            QueryStringBuilder::select(&pattern, &BindingSet::new().with(s.clone(), Literal::from("a")), None),
            Err(MalformedQueryError::LiteralSubject)
        ));
        assert!(matches!(
            QueryStringBuilder::select(&pattern, &BindingSet::new().with(o, BlankNode::default()), None),
            Err(MalformedQueryError::UnsupportedValue { .. })
        ));
        let p = Variable::new("p")?;
        let pattern = StatementPattern::new(TriplePattern {
            subject: s.into(),
            predicate: p.clone().into(),
            object: Literal::from(1).into(),
        });
        assert!(matches!(
            QueryStringBuilder::select(&pattern, &BindingSet::new().with(p, Literal::from(1)), None),
            Err(MalformedQueryError::InvalidPredicate(_))
        ));
        Ok(())
    }
}
