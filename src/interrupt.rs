//! Shared interrupt flag raised by SIGINT/SIGTERM and checked by the poller and batch loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// A flag that is only raised by [Interrupt::raise].
    pub fn new() -> Self {
        Self::default()
    }

    /// Register SIGINT and SIGTERM to raise this flag instead of killing the process,
    /// so the current unit's engine is torn down before exit. A second signal, arriving
    /// while a blocking browser call has not yet returned, exits with status 130.
    pub fn install() -> std::io::Result<Self> {
        let interrupt = Self::new();
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            // Registered first so the first signal sees the flag still lowered.
            signal_hook::flag::register_conditional_shutdown(
                signal,
                130,
                Arc::clone(&interrupt.0),
            )?;
            signal_hook::flag::register(signal, Arc::clone(&interrupt.0))?;
        }
        Ok(interrupt)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let a = Interrupt::new();
        let b = a.clone();
        assert!(!b.is_raised());
        a.raise();
        assert!(b.is_raised());
    }

    #[test]
    fn first_signal_raises_the_flag_without_exiting() -> std::io::Result<()> {
        let interrupt = Interrupt::install()?;
        assert!(!interrupt.is_raised());
        signal_hook::low_level::raise(signal_hook::consts::SIGTERM)?;
        assert!(interrupt.is_raised());
        Ok(())
    }
}
