//! Error kinds surfaced by tree construction, mutation, and serialization.

/// Construction, validation, and serialization failures.
///
/// Runtime failures (non-zero process exits, exhausted resource acquisition)
/// do not surface here; they transition the affected job to
/// [`JobState::Failed`](crate::JobState::Failed) while peer jobs continue.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The job already belongs to a tree.
    #[error("job already belongs to a tree")]
    TreeDefined,

    /// A job with the same name is already part of the tree.
    #[error("job with the same name ({0}) is already part of the tree")]
    JobDefined(String),

    /// A dependency references a job that is not a member of the tree.
    #[error("job {job} is not defined in tree {tree}")]
    JobUndefined {
        /// Name of the referenced job.
        job: String,
        /// Name of the tree the edge was added to.
        tree: String,
    },

    /// Invalid dependency edge, e.g. a self-loop.
    #[error("{0}")]
    Dependency(String),

    /// A state value outside the enumerated set.
    #[error("unknown job state {0}")]
    UnknownState(i64),

    /// The serialized document does not match the schema or version.
    #[error("xml: {0}")]
    Xml(String),

    /// Invalid body mutation, e.g. setting a jobpath on a started job.
    #[error("{0}")]
    Job(String),

    /// Reserved: an iterator advanced past its argument list. The argument
    /// accessor currently clamps instead of raising this.
    #[error("iterator overrun")]
    IteratorOverrun,
}

impl From<quick_xml::Error> for ExecError {
    fn from(err: quick_xml::Error) -> Self {
        ExecError::Xml(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for ExecError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        ExecError::Xml(err.to_string())
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::Xml(err.to_string())
    }
}
