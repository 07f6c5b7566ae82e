use std::cell::Cell;

thread_local! {
    /// Whether the most recent memoized call on this thread replayed a result.
    static LAST_WAS_HIT: Cell<bool> = const { Cell::new(false) };
    /// Memoized calls on this thread that executed their body.
    static EXECUTIONS: Cell<usize> = const { Cell::new(0) };
}

/// Whether the last memoized call was answered from a memo table.
pub fn last_was_hit() -> bool {
    LAST_WAS_HIT.get()
}

/// How many memoized calls on this thread executed their body.
pub fn executions() -> usize {
    EXECUTIONS.get()
}

pub(crate) fn register_hit() {
    LAST_WAS_HIT.set(true);
}

pub(crate) fn register_miss() {
    LAST_WAS_HIT.set(false);
    EXECUTIONS.set(EXECUTIONS.get() + 1);
}
