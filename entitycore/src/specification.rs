//! Composable business rules.
//!
//! A [`Specification`] answers whether a value satisfies a rule and, when it
//! does not, why. Command handlers use [`Specification::check`] to turn an
//! unsatisfied rule into a [`Rejection`].

use crate::command::Rejection;
use std::marker::PhantomData;

/// A business rule over values of type `T`.
pub trait Specification<T: ?Sized> {
    /// Human readable reasons `candidate` fails the rule; empty if it passes.
    fn why_is_not_satisfied_by(&self, candidate: &T) -> Vec<String>;

    /// Whether `candidate` passes the rule.
    fn is_satisfied_by(&self, candidate: &T) -> bool {
        self.why_is_not_satisfied_by(candidate).is_empty()
    }

    /// Rejects with the rule's reasons if `candidate` fails it.
    fn check(&self, candidate: &T) -> Result<(), Rejection> {
        let reasons = self.why_is_not_satisfied_by(candidate);
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(Rejection::with_reasons(reasons))
        }
    }

    /// Both rules must pass.
    fn and<S>(self, other: S) -> And<Self, S>
    where
        Self: Sized,
        S: Specification<T>,
    {
        And(self, other)
    }

    /// At least one rule must pass.
    fn or<S>(self, other: S) -> Or<Self, S>
    where
        Self: Sized,
        S: Specification<T>,
    {
        Or(self, other)
    }

    /// The rule must fail.
    fn not(self) -> Not<Self>
    where
        Self: Sized,
    {
        Not(self)
    }
}

/// Conjunction of two rules. Reports the reasons of every failing side.
#[derive(Debug, Clone, Copy)]
pub struct And<A, B>(A, B);

impl<T: ?Sized, A, B> Specification<T> for And<A, B>
where
    A: Specification<T>,
    B: Specification<T>,
{
    fn why_is_not_satisfied_by(&self, candidate: &T) -> Vec<String> {
        let mut reasons = self.0.why_is_not_satisfied_by(candidate);
        reasons.extend(self.1.why_is_not_satisfied_by(candidate));
        reasons
    }
}

/// Disjunction of two rules. Reports both sides' reasons when neither passes.
#[derive(Debug, Clone, Copy)]
pub struct Or<A, B>(A, B);

impl<T: ?Sized, A, B> Specification<T> for Or<A, B>
where
    A: Specification<T>,
    B: Specification<T>,
{
    fn why_is_not_satisfied_by(&self, candidate: &T) -> Vec<String> {
        let left = self.0.why_is_not_satisfied_by(candidate);
        if left.is_empty() {
            return left;
        }
        let right = self.1.why_is_not_satisfied_by(candidate);
        if right.is_empty() {
            return right;
        }
        left.into_iter().chain(right).collect()
    }
}

/// Negation of a rule.
#[derive(Debug, Clone, Copy)]
pub struct Not<A>(A);

impl<T: ?Sized, A> Specification<T> for Not<A>
where
    A: Specification<T>,
{
    fn why_is_not_satisfied_by(&self, candidate: &T) -> Vec<String> {
        if self.0.is_satisfied_by(candidate) {
            vec!["negated specification is satisfied".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Adapts a predicate and a fixed reason into a rule.
pub struct Predicate<F, T: ?Sized> {
    predicate: F,
    reason: String,
    _candidate: PhantomData<fn(&T)>,
}

impl<F, T: ?Sized> Predicate<F, T>
where
    F: Fn(&T) -> bool,
{
    /// Passes when `predicate` returns true; otherwise fails with `reason`.
    pub fn new(reason: impl Into<String>, predicate: F) -> Self {
        Self {
            predicate,
            reason: reason.into(),
            _candidate: PhantomData,
        }
    }
}

impl<F, T: ?Sized> Specification<T> for Predicate<F, T>
where
    F: Fn(&T) -> bool,
{
    fn why_is_not_satisfied_by(&self, candidate: &T) -> Vec<String> {
        if (self.predicate)(candidate) {
            Vec::new()
        } else {
            vec![self.reason.clone()]
        }
    }
}

/// State that knows whether its entity has been created yet.
pub trait Created {
    /// Whether a creating event has been applied.
    fn is_created(&self) -> bool;
}

/// Passes for entities that have not been created yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityIsNew;

impl<S: Created + ?Sized> Specification<S> for EntityIsNew {
    fn why_is_not_satisfied_by(&self, candidate: &S) -> Vec<String> {
        if candidate.is_created() {
            vec!["Aggregate already exists.".to_string()]
        } else {
            Vec::new()
        }
    }
}
