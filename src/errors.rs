//! Planner error taxonomy.
//!
//! Catalog inconsistencies and resource exhaustion are fatal for the
//! statement being planned. The inability to build a cluster path is not an
//! error at all: the planner silently degrades to a local-only plan.

use smol_str::SmolStr;
use std::fmt;
use thiserror::Error;

/// Things the planner reports errors about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    AppendRel,
    Function,
    JoinLevel,
    Locator,
    Query,
    RangeEntry,
    Relation,
    Value,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = match self {
            Entity::AppendRel => "append relation",
            Entity::Function => "function",
            Entity::JoinLevel => "join level",
            Entity::Locator => "locator",
            Entity::Query => "query",
            Entity::RangeEntry => "range table entry",
            Entity::Relation => "relation",
            Entity::Value => "value",
        };
        write!(f, "{p}")
    }
}

/// Actions that may fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Cast,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = match self {
            Action::Cast => "cast",
        };
        write!(f, "{p}")
    }
}

fn opt_suffix(msg: &Option<SmolStr>) -> String {
    match msg {
        Some(m) => format!(": {m}"),
        None => String::new(),
    }
}

fn opt_entity(entity: &Option<Entity>) -> String {
    match entity {
        Some(e) => format!(" {e}"),
        None => String::new(),
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlannerError {
    /// The node catalog or the distribution catalog is inconsistent.
    #[error("catalog inconsistency: {0}")]
    Configuration(SmolStr),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(SmolStr),
    #[error("{0} not found: {1}")]
    NotFound(Entity, SmolStr),
    #[error("invalid {0}{}", opt_suffix(.1))]
    Invalid(Entity, Option<SmolStr>),
    #[error("unsupported {0}{}", opt_suffix(.1))]
    Unsupported(Entity, Option<SmolStr>),
    #[error("failed to {0}{}: {2}", opt_entity(.1))]
    FailedTo(Action, Option<Entity>, SmolStr),
    /// No path exists for a required part of the query.
    #[error("could not devise a query plan: {0}")]
    NoPlan(SmolStr),
    #[error("out of memory while building path lists")]
    OutOfMemory,
    #[error("canceling statement due to user request")]
    Canceled,
    #[error("canceling statement due to statement timeout")]
    StatementTimeout,
    #[error("stack depth limit exceeded at depth {0}")]
    StackDepthExceeded(usize),
}

impl From<std::collections::TryReserveError> for PlannerError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<serde_yaml::Error> for PlannerError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::InvalidConfiguration(smol_str::format_smolstr!("{e}"))
    }
}

impl PlannerError {
    /// Errors that abort planning because the catalog is corrupted.
    #[must_use]
    pub fn is_catalog_inconsistency(&self) -> bool {
        matches!(self, PlannerError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use smol_str::format_smolstr;

    #[test]
    fn error_messages() {
        assert_eq!(
            PlannerError::Invalid(Entity::Locator, Some(format_smolstr!("code X"))).to_string(),
            "invalid locator: code X"
        );
        assert_eq!(
            PlannerError::Invalid(Entity::Value, None).to_string(),
            "invalid value"
        );
        assert_eq!(
            PlannerError::FailedTo(Action::Cast, Some(Entity::Value), "1.5 to integer".into())
                .to_string(),
            "failed to cast value: 1.5 to integer"
        );
        assert_eq!(
            PlannerError::FailedTo(Action::Cast, None, "nothing".into()).to_string(),
            "failed to cast: nothing"
        );
        assert!(PlannerError::Configuration("x".into()).is_catalog_inconsistency());
    }
}
