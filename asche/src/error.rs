use thiserror::Error;

/// Allocation failures that propagate to the public entry points.
///
/// Protocol violations (freeing an unknown pointer, mismatched stubborn
/// calls) do not appear here; those are bugs in the calling runtime and
/// abort after logging instead of being reported.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The block pool is empty and the OS memory provider refused to grow
    /// the heap.
    #[error("heap exhausted while allocating {requested} bytes")]
    HeapExhausted { requested: usize },

    /// The address index could not grow a bottom-level node for a new heap
    /// region.
    #[error("address index exhausted (bottom node limit reached)")]
    IndexExhausted,
}

pub type AllocResult<T> = std::result::Result<T, AllocError>;

/// Protocol violations indicate a bug in the calling runtime; recovery is
/// not attempted. The message is logged before the abort so post-mortem
/// debugging works without a debugger attached.
pub(crate) fn fatal_violation(msg: String) -> ! {
    log::error!("{msg}");
    panic!("{msg}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_exhausted_display_names_the_request() {
        let err = AllocError::HeapExhausted { requested: 4096 };
        assert_eq!(
            err.to_string(),
            "heap exhausted while allocating 4096 bytes"
        );
    }
}
