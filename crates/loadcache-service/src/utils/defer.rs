/// Guard that runs a closure when dropped.
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers a closure, returning a `DeferGuard` that will
/// run it when dropped.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_runs_on_early_return() {
        let ran = Cell::new(false);
        let write = |fail: bool| -> Result<(), ()> {
            let _guard = defer(|| ran.set(true));
            if fail {
                return Err(());
            }
            Ok(())
        };

        assert!(write(true).is_err());
        assert!(ran.get());
    }
}
