use crate::error::{EvaluationError, MalformedQueryError};
use crate::model::BindingSet;
use oxrdf::{Dataset, Variable};
use spareval::{QueryEvaluator, QueryResults};
use spargebra::Query;
use spargebra::algebra::{Expression, GraphPattern};
use spargebra::term::GroundTerm;
use std::fmt;

/// A filter attached to a statement pattern.
///
/// Depending on the strategy of a source, it is either folded into the query sent to the source
/// or evaluated on each binding set the source returns.
///
/// ```
/// use oxrdf::{Literal, Variable};
/// use sparfed::{BindingSet, FilterExpr};
/// use spargebra::algebra::Expression;
///
/// let x = Variable::new("x")?;
/// let filter = FilterExpr::new(Expression::Greater(
///     Box::new(x.clone().into()),
///     Box::new(Literal::from(2).into()),
/// ))?;
/// assert!(filter.evaluate(&BindingSet::new().with(x.clone(), Literal::from(3)))?);
/// assert!(!filter.evaluate(&BindingSet::new().with(x, Literal::from(1)))?);
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FilterExpr {
    expression: Expression,
    variables: Vec<Variable>,
}

impl FilterExpr {
    /// Wraps a filter expression.
    ///
    /// `EXISTS` and `NOT EXISTS` are refused: they need a dataset to be evaluated against.
    pub fn new(expression: Expression) -> Result<Self, MalformedQueryError> {
        let mut variables = Vec::new();
        collect_variables(&expression, &mut variables)?;
        Ok(Self {
            expression,
            variables,
        })
    }

    #[inline]
    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    /// The variables used by the expression, in order of first appearance
    #[inline]
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// The values of the bound variables of the filter if they can all be written into a `VALUES` clause.
    ///
    /// Returns `None` if one of them is a blank node: the filter must then be evaluated locally.
    pub(crate) fn ground_values(
        &self,
        bindings: &BindingSet,
    ) -> Option<Vec<(Variable, GroundTerm)>> {
        self.variables
            .iter()
            .filter_map(|v| Some((v, bindings.get(v)?)))
            .map(|(v, t)| Some((v.clone(), GroundTerm::try_from(t.clone()).ok()?)))
            .collect()
    }

    /// Evaluates the filter against the given binding set.
    ///
    /// Following SPARQL semantics, an expression evaluation error means `false`.
    pub fn evaluate(&self, bindings: &BindingSet) -> Result<bool, EvaluationError> {
        let substitutions = self
            .variables
            .iter()
            .filter_map(|v| Some((v.clone(), bindings.get(v)?.clone())))
            .collect::<Vec<_>>();
        let query = Query::Select {
            dataset: None,
            pattern: GraphPattern::Project {
                inner: Box::new(GraphPattern::Filter {
                    expr: self.expression.clone(),
                    inner: Box::new(GraphPattern::Bgp {
                        patterns: Vec::new(),
                    }),
                }),
                variables: substitutions.iter().map(|(v, _)| v.clone()).collect(),
            },
            base_iri: None,
        };
        let dataset = Dataset::new();
        let results = QueryEvaluator::new()
            .execute_with_substituted_variables(&dataset, &query, substitutions)
            .map_err(|e| EvaluationError::Unexpected(Box::new(e)))?;
        let QueryResults::Solutions(mut solutions) = results else {
            return Err(EvaluationError::Unexpected(
                "A SELECT query should return solutions".into(),
            ));
        };
        solutions
            .next()
            .transpose()
            .map(|solution| solution.is_some())
            .map_err(|e| EvaluationError::Unexpected(Box::new(e)))
    }
}

impl fmt::Display for FilterExpr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.expression.fmt(f)
    }
}

impl fmt::Debug for FilterExpr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FILTER({})", self.expression)
    }
}

fn collect_variables(
    expression: &Expression,
    variables: &mut Vec<Variable>,
) -> Result<(), MalformedQueryError> {
    match expression {
        Expression::NamedNode(_) | Expression::Literal(_) => (),
        Expression::Variable(v) | Expression::Bound(v) => {
            if !variables.contains(v) {
                variables.push(v.clone());
            }
        }
        Expression::Or(a, b)
        | Expression::And(a, b)
        | Expression::Equal(a, b)
        | Expression::SameTerm(a, b)
        | Expression::Greater(a, b)
        | Expression::GreaterOrEqual(a, b)
        | Expression::Less(a, b)
        | Expression::LessOrEqual(a, b)
        | Expression::Add(a, b)
        | Expression::Subtract(a, b)
        | Expression::Multiply(a, b)
        | Expression::Divide(a, b) => {
            collect_variables(a, variables)?;
            collect_variables(b, variables)?;
        }
        Expression::UnaryPlus(e) | Expression::UnaryMinus(e) | Expression::Not(e) => {
            collect_variables(e, variables)?;
        }
        Expression::In(e, list) => {
            collect_variables(e, variables)?;
            for e in list {
                collect_variables(e, variables)?;
            }
        }
        Expression::If(a, b, c) => {
            collect_variables(a, variables)?;
            collect_variables(b, variables)?;
            collect_variables(c, variables)?;
        }
        Expression::Coalesce(list) | Expression::FunctionCall(_, list) => {
            for e in list {
                collect_variables(e, variables)?;
            }
        }
        Expression::Exists(_) => {
            return Err(MalformedQueryError::UnsupportedFilter(format!(
                "EXISTS is not supported in statement pattern filters: {expression}"
            )));
        }
    }
    Ok(())
}
