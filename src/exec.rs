//! Worker-pool seam.
//!
//! The codec never spawns threads. Batches of independent closures go
//! through an `Executor`; the built-in `SingleThread` runs them inline,
//! and an embedder can bridge to its own pool. A shared success flag lets
//! queued work short-circuit after the first failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A batch task. Tasks in one batch are independent and may run in any
/// order or in parallel; `run` returns only after all of them finished.
pub type Task<'a> = Box<dyn FnOnce() + Send + 'a>;

pub trait Executor {
  /// Run a batch to completion.
  fn run(&self, tasks: Vec<Task<'_>>);

  /// Worker count the caller may size scratch buffers by.
  fn concurrency(&self) -> usize {
    1
  }
}

/// In-order, same-thread execution.
#[derive(Default)]
pub struct SingleThread;

impl Executor for SingleThread {
  fn run(&self, tasks: Vec<Task<'_>>) {
    for task in tasks {
      task();
    }
  }
}

/// Cooperative cancellation: set on first failure, polled at task start.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;

  #[test]
  fn single_thread_runs_in_order() {
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut tasks: Vec<Task<'_>> = Vec::new();
    for i in 0..5 {
      let log = log.clone();
      tasks.push(Box::new(move || log.lock().unwrap().push(i)));
    }
    SingleThread.run(tasks);
    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
  }

  #[test]
  fn cancel_flag_short_circuits() {
    let flag = CancelFlag::new();
    let ran = Arc::new(AtomicU32::new(0));
    let mut tasks: Vec<Task<'_>> = Vec::new();
    for i in 0..4 {
      let flag = flag.clone();
      let ran = ran.clone();
      tasks.push(Box::new(move || {
        if flag.is_cancelled() {
          return;
        }
        ran.fetch_add(1, Ordering::SeqCst);
        if i == 1 {
          flag.cancel();
        }
      }));
    }
    SingleThread.run(tasks);
    assert_eq!(ran.load(Ordering::SeqCst), 2);
  }
}
