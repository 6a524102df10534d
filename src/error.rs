use thiserror::Error;

/// Failure to reach a pooled entry through a [`Ref`](crate::Ref).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum RefError {
    /// The handle holds no slot.
    #[error("dereferencing an empty pool handle")]
    Empty,
    /// The reallocation guard was taken on a different pool.
    #[error("reallocation guard belongs to a different pool")]
    WrongPool,
}
