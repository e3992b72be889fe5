use crate::error::EvaluationError;
use oxrdf::{Term, Variable};
use sparesults::QuerySolution;
use std::cmp::Ordering;
use std::iter::{empty, once};
use std::ops::Index;
use std::sync::Arc;
use std::{fmt, mem};

/// An immutable set of variable bindings.
///
/// Keys are unique and kept sorted so that two binding sets with the same content are equal
/// whatever order they have been built in.
/// Cloning is cheap: the content is shared behind an [`Arc`].
///
/// ```
/// use oxrdf::{Literal, Variable};
/// use sparfed::BindingSet;
///
/// let x = Variable::new("x")?;
/// let bindings = BindingSet::new().with(x.clone(), Literal::from(1));
/// assert_eq!(bindings.get("x"), Some(&Literal::from(1).into()));
/// assert!(bindings.get("y").is_none());
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct BindingSet {
    bindings: Arc<[(Variable, Term)]>,
}

impl BindingSet {
    /// The empty binding set
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value bound to the given variable if any
    pub fn get(&self, variable: impl VariableName) -> Option<&Term> {
        let name = variable.name();
        self.bindings
            .binary_search_by(|(v, _)| v.as_str().cmp(name))
            .ok()
            .map(|i| &self.bindings[i].1)
    }

    /// Returns if the variable is bound
    #[inline]
    pub fn contains(&self, variable: impl VariableName) -> bool {
        self.get(variable).is_some()
    }

    /// Iterates over the bound variables and their values, sorted by variable name
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &Term)> {
        self.bindings.iter().map(|(v, t)| (v, t))
    }

    /// The bound variables, sorted by name
    #[inline]
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.bindings.iter().map(|(v, _)| v)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Returns a new binding set with the given variable bound.
    ///
    /// A previous value of the variable is overridden.
    #[must_use]
    pub fn with(&self, variable: Variable, value: impl Into<Term>) -> Self {
        self.iter()
            .map(|(v, t)| (v.clone(), t.clone()))
            .chain(once((variable, value.into())))
            .collect()
    }

    /// Merges the two binding sets.
    ///
    /// Returns `None` if they bind the same variable to different values.
    pub fn merge(&self, other: &Self) -> Option<Self> {
        if other.is_empty() {
            return Some(self.clone());
        }
        if self.is_empty() {
            return Some(other.clone());
        }
        let mut bindings = Vec::with_capacity(self.len() + other.len());
        let (left, right) = (&*self.bindings, &*other.bindings);
        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            match left[i].0.as_str().cmp(right[j].0.as_str()) {
                Ordering::Less => {
                    bindings.push(left[i].clone());
                    i += 1;
                }
                Ordering::Greater => {
                    bindings.push(right[j].clone());
                    j += 1;
                }
                Ordering::Equal => {
                    if left[i].1 != right[j].1 {
                        return None;
                    }
                    bindings.push(left[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        bindings.extend_from_slice(&left[i..]);
        bindings.extend_from_slice(&right[j..]);
        Some(Self {
            bindings: bindings.into(),
        })
    }
}

impl FromIterator<(Variable, Term)> for BindingSet {
    /// Builds a binding set, the last value wins if a variable is given multiple times
    fn from_iter<I: IntoIterator<Item = (Variable, Term)>>(iter: I) -> Self {
        let mut bindings = iter.into_iter().collect::<Vec<_>>();
        // The sort is stable: the last occurrence of each variable ends up last
        bindings.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
        let mut deduplicated: Vec<(Variable, Term)> = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match deduplicated.last_mut() {
                Some(last) if last.0 == binding.0 => *last = binding,
                _ => deduplicated.push(binding),
            }
        }
        Self {
            bindings: deduplicated.into(),
        }
    }
}

impl From<QuerySolution> for BindingSet {
    #[inline]
    fn from(solution: QuerySolution) -> Self {
        solution
            .iter()
            .map(|(v, t)| (v.clone(), t.clone()))
            .collect()
    }
}

impl From<&BindingSet> for QuerySolution {
    fn from(bindings: &BindingSet) -> Self {
        let (variables, values): (Vec<_>, Vec<_>) = bindings
            .iter()
            .map(|(v, t)| (v.clone(), Some(t.clone())))
            .unzip();
        (variables, values).into()
    }
}

impl Index<&str> for BindingSet {
    type Output = Term;

    #[inline]
    #[expect(clippy::panic)]
    fn index(&self, variable: &str) -> &Term {
        self.get(variable)
            .unwrap_or_else(|| panic!("The variable ?{variable} is not bound"))
    }
}

impl fmt::Debug for BindingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl fmt::Display for BindingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (variable, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{variable} -> {value}")?;
        }
        f.write_str("}")
    }
}

/// Something that names a variable: a [`Variable`] or a [`str`] without the leading `?`.
pub trait VariableName {
    fn name(&self) -> &str;
}

impl VariableName for &str {
    #[inline]
    fn name(&self) -> &str {
        self
    }
}

impl VariableName for &Variable {
    #[inline]
    fn name(&self) -> &str {
        self.as_str()
    }
}

/// A closeable stream of [`BindingSet`]s.
///
/// This is what the federated evaluation returns.
/// [`close`](Self::close) releases the underlying producers early, it is also done on drop.
pub struct BindingSetIter {
    iter: Box<dyn Iterator<Item = Result<BindingSet, EvaluationError>> + Send>,
}

impl BindingSetIter {
    pub fn new(
        iter: impl IntoIterator<
            Item = Result<BindingSet, EvaluationError>,
            IntoIter: Send + 'static,
        >,
    ) -> Self {
        Self {
            iter: Box::new(iter.into_iter()),
        }
    }

    /// A stream without any result
    #[inline]
    pub fn empty() -> Self {
        Self::new(empty())
    }

    /// A stream with exactly one result
    #[inline]
    pub fn single(bindings: BindingSet) -> Self {
        Self::new(once(Ok(bindings)))
    }

    /// Stops the stream and releases the resources of its producers.
    ///
    /// Calling it multiple times is fine, the following calls to [`next`](Iterator::next) return `None`.
    pub fn close(&mut self) {
        drop(mem::replace(&mut self.iter, Box::new(empty())));
    }

    /// Only keeps the results the predicate accepts.
    #[must_use]
    pub fn filter_results(
        self,
        mut predicate: impl FnMut(&BindingSet) -> Result<bool, EvaluationError> + Send + 'static,
    ) -> Self {
        Self::new(self.filter_map(move |result| match result {
            Ok(bindings) => match predicate(&bindings) {
                Ok(true) => Some(Ok(bindings)),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(e)),
        }))
    }
}

impl Iterator for BindingSetIter {
    type Item = Result<BindingSet, EvaluationError>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

#[cfg(test)]
#[expect(clippy::panic_in_result_fn)]
mod tests {
    use super::*;
    use oxrdf::{Literal, NamedNode};
    use std::error::Error;

    #[test]
    fn construction_order_does_not_matter() -> Result<(), Box<dyn Error>> {
        let a = Variable::new("a")?;
        let b = Variable::new("b")?;
        let ex = NamedNode::new("http://example.com/")?;
        let left = BindingSet::new()
            .with(a.clone(), ex.clone())
            .with(b.clone(), Literal::from(1));
        let right = BindingSet::from_iter([
            (b, Literal::from(1).into()),
            (a, ex.into()),
        ]);
        assert_eq!(left, right);
        Ok(())
    }

    #[test]
    fn with_overrides_and_keeps_original() -> Result<(), Box<dyn Error>> {
        let a = Variable::new("a")?;
        let original = BindingSet::new().with(a.clone(), Literal::from(1));
        let updated = original.with(a, Literal::from(2));
        assert_eq!(original["a"], Literal::from(1).into());
        assert_eq!(updated["a"], Literal::from(2).into());
        assert_eq!(updated.len(), 1);
        Ok(())
    }

    #[test]
    fn merge_compatible_and_conflicting() -> Result<(), Box<dyn Error>> {
        let a = Variable::new("a")?;
        let b = Variable::new("b")?;
        let c = Variable::new("c")?;
        let left = BindingSet::new()
            .with(a.clone(), Literal::from(1))
            .with(c.clone(), Literal::from(3));
        let right = BindingSet::new()
            .with(b, Literal::from(2))
            .with(c.clone(), Literal::from(3));
        let merged = left.merge(&right).ok_or("merge should succeed")?;
        assert_eq!(merged.len(), 3);
        assert_eq!(merged["b"], Literal::from(2).into());

        let conflict = BindingSet::new().with(a, Literal::from(10));
        assert!(left.merge(&conflict).is_none());
        assert_eq!(left.merge(&BindingSet::new()), Some(left.clone()));
        Ok(())
    }

    #[test]
    fn query_solution_conversion() -> Result<(), Box<dyn Error>> {
        let solution = QuerySolution::from((
            vec![Variable::new("y")?, Variable::new("x")?],
            vec![Some(Literal::from(1).into()), None],
        ));
        let bindings = BindingSet::from(solution);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings.get("y"), Some(&Literal::from(1).into()));
        assert_eq!(bindings.to_string(), "{?y -> \"1\"^^<http://www.w3.org/2001/XMLSchema#integer>}");
        Ok(())
    }

    #[test]
    fn close_is_idempotent() {
        let mut iter = BindingSetIter::single(BindingSet::new());
        iter.close();
        iter.close();
        assert!(iter.next().is_none());
    }
}
