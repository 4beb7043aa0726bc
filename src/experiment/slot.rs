use crate::error::{ExperimentError, RunResult};
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

type Inner<T> = Arc<Mutex<Option<Arc<T>>>>;

/// Holds at most one active experiment per process.
pub struct ExperimentSlot<T> {
    inner: Inner<T>,
}

impl<T> Clone for ExperimentSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for ExperimentSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ExperimentSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Installs `run` if the slot is free. The slot is cleared when the
    /// returned guard is dropped.
    pub fn try_acquire(&self, run: T) -> RunResult<SlotGuard<T>> {
        let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(ExperimentError::AlreadyRunning);
        }
        let run = Arc::new(run);
        *slot = Some(run.clone());
        Ok(SlotGuard {
            run,
            slot: self.inner.clone(),
        })
    }

    pub fn current(&self) -> Option<Arc<T>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_none()
    }
}

pub struct SlotGuard<T> {
    run: Arc<T>,
    slot: Inner<T>,
}

impl<T> SlotGuard<T> {
    pub fn run(&self) -> Arc<T> {
        self.run.clone()
    }
}

impl<T> Deref for SlotGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.run
    }
}

impl<T> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, &self.run)) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_rejected() {
        let slot = ExperimentSlot::new();
        let guard = slot.try_acquire("first").unwrap();
        let err = slot.try_acquire("second").err().unwrap();
        assert!(matches!(err, ExperimentError::AlreadyRunning));
        // the active run is untouched
        assert_eq!(*slot.current().unwrap(), "first");
        assert_eq!(*guard, "first");
    }

    #[test]
    fn test_drop_releases() {
        let slot = ExperimentSlot::new();
        {
            let _guard = slot.try_acquire(1u32).unwrap();
            assert!(!slot.is_empty());
        }
        assert!(slot.is_empty());
        assert!(slot.try_acquire(2u32).is_ok());
    }

    #[test]
    fn test_released_on_panic() {
        let slot = ExperimentSlot::new();
        let cloned = slot.clone();
        let res = std::thread::spawn(move || {
            let _guard = cloned.try_acquire(()).unwrap();
            panic!("round loop blew up");
        })
        .join();
        assert!(res.is_err());
        assert!(slot.is_empty());
    }
}
