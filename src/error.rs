
use crate::mem::MemError;

/// Stack-level errors
#[derive(Debug, Clone, PartialEq)]
pub enum StackError<E> {
    /// Transmit queue full
    QueueFull,

    /// Table at configured capacity
    TableFull,

    /// No route to the requested destination
    NoRoute,

    /// Frame or message failed to decode
    Decode,

    /// Authentication or replay check failed
    AuthFailed,

    /// Memory arena failure
    Mem(MemError),

    /// Operation timed out
    Timeout,

    /// Resource busy
    Busy,

    /// Wrapper for unhandled / underlying radio errors
    Radio(E),
}

impl<E> From<MemError> for StackError<E> {
    fn from(e: MemError) -> Self {
        StackError::Mem(e)
    }
}
