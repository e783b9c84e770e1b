//! Predicates over build entries.
//!
//! Any `Fn(&BuildEntry) -> bool` is a predicate; the named types below exist
//! so rules read from configuration can be built without closures.

use crate::entry::{BuildEntry, OptionValue};

/// Decides whether a rule applies to an entry.
pub trait BuildPredicate {
    fn matches(&self, entry: &BuildEntry) -> bool;

    fn and<P: BuildPredicate>(self, other: P) -> And<Self, P>
    where
        Self: Sized,
    {
        And(self, other)
    }

    fn or<P: BuildPredicate>(self, other: P) -> Or<Self, P>
    where
        Self: Sized,
    {
        Or(self, other)
    }

    fn not(self) -> Not<Self>
    where
        Self: Sized,
    {
        Not(self)
    }
}

impl<F> BuildPredicate for F
where
    F: Fn(&BuildEntry) -> bool,
{
    fn matches(&self, entry: &BuildEntry) -> bool {
        self(entry)
    }
}

/// Matches entries whose setting `key` equals `value`.
#[derive(Debug, Clone)]
pub struct SettingEquals {
    pub key: String,
    pub value: String,
}

impl SettingEquals {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl BuildPredicate for SettingEquals {
    fn matches(&self, entry: &BuildEntry) -> bool {
        entry.setting(&self.key) == Some(self.value.as_str())
    }
}

/// Matches entries whose option `key` equals `value`.
#[derive(Debug, Clone)]
pub struct OptionEquals {
    pub key: String,
    pub value: OptionValue,
}

impl OptionEquals {
    pub fn new(key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl BuildPredicate for OptionEquals {
    fn matches(&self, entry: &BuildEntry) -> bool {
        entry.option(&self.key) == Some(&self.value)
    }
}

/// Matches every entry or none, regardless of its contents.
#[derive(Debug, Clone, Copy)]
pub struct Constant(pub bool);

impl BuildPredicate for Constant {
    fn matches(&self, _entry: &BuildEntry) -> bool {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct And<A, B>(A, B);

impl<A: BuildPredicate, B: BuildPredicate> BuildPredicate for And<A, B> {
    fn matches(&self, entry: &BuildEntry) -> bool {
        self.0.matches(entry) && self.1.matches(entry)
    }
}

#[derive(Debug, Clone)]
pub struct Or<A, B>(A, B);

impl<A: BuildPredicate, B: BuildPredicate> BuildPredicate for Or<A, B> {
    fn matches(&self, entry: &BuildEntry) -> bool {
        self.0.matches(entry) || self.1.matches(entry)
    }
}

#[derive(Debug, Clone)]
pub struct Not<A>(A);

impl<A: BuildPredicate> BuildPredicate for Not<A> {
    fn matches(&self, entry: &BuildEntry) -> bool {
        !self.0.matches(entry)
    }
}
