use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("backing store could not supply memory")]
    OOM,
    #[error("allocation size overflowed")]
    AllocOverflow,
}
