//! Tunables for the lock-coupling backoff loops

/// Configuration for the spin-wait loops used while acquiring node locks.
///
/// `lock_parent` and `acquire_tree_locks` both retry in the face of
/// concurrent structural changes. This struct controls how much each retry
/// yields the OS thread before trying again, trading CPU burn against
/// latency under heavy contention.
///
/// # Example
///
/// ```
/// use logitree_map::config::BackoffConfig;
///
/// let config = BackoffConfig {
///     max_spins: 64,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Number of busy-spin iterations attempted before falling back to
    /// `std::thread::yield_now`.
    pub max_spins: u32,

    /// Whether to call `std::thread::yield_now` after `max_spins` busy
    /// iterations. Disabling this keeps the loop pure busy-spin, useful for
    /// latency-sensitive deployments willing to burn CPU.
    pub yield_after_spins: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_spins: 32,
            yield_after_spins: true,
        }
    }
}

impl BackoffConfig {
    /// Runs one unit of backoff: `spins` busy spins, then an optional yield.
    pub(crate) fn backoff_once(&self, spins: u32) {
        if spins < self.max_spins {
            std::hint::spin_loop();
        } else if self.yield_after_spins {
            std::thread::yield_now();
        }
    }
}
