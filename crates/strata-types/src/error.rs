use std::fmt;

/// Which part of a policy an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Filter,
    Selector,
    Replica,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::Filter => "filter",
            ObjectKind::Selector => "selector",
            ObjectKind::Replica => "replica",
        })
    }
}

/// Policy rejected before any evaluation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: ObjectKind, name: String },
    #[error("{kind} '{from}' references unknown {target} '{name}'")]
    UnresolvedReference {
        kind: ObjectKind,
        from: String,
        target: ObjectKind,
        name: String,
    },
    #[error("filter '{name}' is part of a reference cycle: {}", .path.join(" -> "))]
    CyclicReference { name: String, path: Vec<String> },
    #[error("{kind} '{name}' has zero count")]
    InvalidCount { kind: ObjectKind, name: String },
    #[error("invalid filter '{name}': {reason}")]
    InvalidFilter { name: String, reason: &'static str },
}

/// Failures while evaluating a compiled plan.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// Should be impossible after a successful compile.
    #[error("unknown filter reference '{0}'")]
    UnknownFilterReference(String),
    #[error("unknown selector '{0}'")]
    UnknownSelector(String),
    #[error("evaluation cancelled")]
    Cancelled,
    #[error("evaluation deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Compile(#[from] CompileError),
}
