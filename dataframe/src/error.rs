use std::fmt;

/// Precondition violations raised at the public API boundary, where the caller
/// passes column indices or a projection that aren't trusted to already be
/// valid (as opposed to internal invariants, which stay `assert!`s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A `map` parent index did not reference an already-existing column; the
    /// dependency DAG is enforced by construction order, so this can only name
    /// a column at or past the one currently being created.
    InvalidParentColumn { index: usize, column_count: usize },
    /// `iter` was asked to project no columns at all.
    EmptyProjection,
    /// A projected column index is past the end of the dataframe's schema.
    ColumnOutOfRange { index: usize, column_count: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParentColumn { index, column_count } => write!(
                f,
                "parent column index {index} is out of range for a dataframe with {column_count} columns"
            ),
            Error::EmptyProjection => write!(f, "iterator projection must select at least one column"),
            Error::ColumnOutOfRange { index, column_count } => write!(
                f,
                "projected column index {index} is out of range for a dataframe with {column_count} columns"
            ),
        }
    }
}

impl std::error::Error for Error {}

/// Prefetching is a reserved, permanently-unsupported operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchUnsupported;

impl fmt::Display for PrefetchUnsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prefetching is not supported")
    }
}

impl std::error::Error for PrefetchUnsupported {}

/// Status returned by each step of an [`crate::iter::Iter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    EndOfStream,
}
