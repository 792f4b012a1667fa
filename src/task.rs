//! The opaque caller-supplied collaborators: [`Task`] and [`Output`]
//! (spec.md §3 "Task"/"Output", §6.3).

use std::{fmt, io, sync::Arc, time::SystemTime};

/// An external artifact produced by a task. Opaque to the engine:
/// only its timestamp and deletion are observable.
///
/// Equality of outputs is reference-identity only (spec.md §3), so
/// the engine always holds outputs behind `Arc<dyn Output>` and
/// compares them with [`Arc::ptr_eq`] rather than any `PartialEq`
/// impl on the trait itself.
pub trait Output: fmt::Debug + Send + Sync {
    /// Absent means "does not exist".
    fn timestamp(&self) -> io::Result<Option<SystemTime>>;

    /// Idempotent: deleting an already-deleted output must not error.
    fn delete(&self) -> io::Result<()>;
}

/// Two instances naming the same underlying artifact are still
/// distinct per spec.md's reference-identity rule; this helper exists
/// so callers (the remover, the analyzer) don't have to spell out
/// `Arc::ptr_eq` themselves.
pub fn same_output(a: &Arc<dyn Output>, b: &Arc<dyn Output>) -> bool {
    Arc::ptr_eq(a, b)
}

/// A caller-supplied unit of work. `outputs()` must be stable: two
/// calls on the same `Task` must describe the same outputs (spec.md
/// §3).
pub trait Task: fmt::Debug + Send + Sync {
    fn outputs(&self) -> Vec<Arc<dyn Output>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory [`Output`] used throughout the test suite: a cell
    /// holding an optional timestamp, mutable so tests can simulate a
    /// task "writing" its output or a caller deleting it out of band.
    #[derive(Debug)]
    pub struct CellOutput {
        pub(crate) timestamp: Mutex<Option<SystemTime>>,
        pub(crate) fail_delete: Mutex<bool>,
    }

    impl CellOutput {
        pub fn new() -> Arc<Self> {
            Arc::new(CellOutput {
                timestamp: Mutex::new(None),
                fail_delete: Mutex::new(false),
            })
        }

        pub fn touch(&self, at: SystemTime) {
            *self.timestamp.lock().unwrap() = Some(at);
        }

        pub fn fail_next_delete(&self) {
            *self.fail_delete.lock().unwrap() = true;
        }
    }

    impl Output for CellOutput {
        fn timestamp(&self) -> io::Result<Option<SystemTime>> {
            Ok(*self.timestamp.lock().unwrap())
        }

        fn delete(&self) -> io::Result<()> {
            let mut fail = self.fail_delete.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(io::Error::new(io::ErrorKind::Other, "mock delete failure"));
            }
            *self.timestamp.lock().unwrap() = None;
            Ok(())
        }
    }

    /// A task whose `run` behavior is driven by tests: it touches its
    /// own outputs with a caller-chosen timestamp on success.
    #[derive(Debug)]
    pub struct StubTask {
        pub(crate) outputs: Vec<Arc<CellOutput>>,
    }

    impl StubTask {
        pub fn new(outputs: Vec<Arc<CellOutput>>) -> Arc<Self> {
            Arc::new(StubTask { outputs })
        }

        pub fn finish_at(&self, at: SystemTime) {
            for output in &self.outputs {
                output.touch(at);
            }
        }
    }

    impl Task for StubTask {
        fn outputs(&self) -> Vec<Arc<dyn Output>> {
            self.outputs
                .iter()
                .map(|o| o.clone() as Arc<dyn Output>)
                .collect()
        }
    }
}
