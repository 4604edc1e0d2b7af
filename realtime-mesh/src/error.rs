use crate::{BatchError, OutOfRange, SectionId};

/// Error from [`RealtimeMesh::submit()`](crate::RealtimeMesh::submit).
///
/// Whatever the error, the section is left at its last published version and the caller may
/// retry, with a corrected batch if the batch itself was at fault.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum SubmitError {
    /// The batch was malformed or its operations were out of order.
    #[error("invalid batch")]
    InvalidBatch(#[from] BatchError),

    /// A write exceeded the bounds of a stream.
    #[error("stream write out of range")]
    OutOfRange(#[from] OutOfRange),

    /// Another batch was being committed to the section, and the mesh is configured with
    /// [`ContentionPolicy::Fail`](crate::config::ContentionPolicy::Fail).
    #[error("section {0} is busy with another commit")]
    Busy(SectionId),

    /// The section does not exist or has been removed.
    #[error("section {0} does not exist")]
    UnknownSection(SectionId),
}

impl SubmitError {
    /// Returns whether resubmitting the same batch later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::Busy(_))
    }
}
