//! Scripted operations for exercising retry and orchestration paths

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};

/// Operation that replays a fixed sequence of outcomes
///
/// Each invocation pops the next scripted result. Once the script is
/// exhausted the last outcome is repeated. Clones share the script and the
/// call counter.
#[derive(Debug, Clone)]
pub struct ScriptedOperation<T> {
    script: Arc<Mutex<VecDeque<EngineResult<T>>>>,
    last: Arc<Mutex<Option<EngineResult<T>>>>,
    calls: Arc<AtomicU32>,
}

impl<T: Clone + Send + 'static> ScriptedOperation<T> {
    /// Replays `script` in order, one result per call
    pub fn new(script: Vec<EngineResult<T>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            last: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fail `failures` times with `error`, then succeed with `value`
    pub fn failing_then(failures: usize, error: EngineError, value: T) -> Self {
        let mut script: Vec<EngineResult<T>> = (0..failures).map(|_| Err(error.clone())).collect();
        script.push(Ok(value));
        Self::new(script)
    }

    /// Always fail with `error`
    pub fn always_failing(error: EngineError) -> Self {
        Self::new(vec![Err(error)])
    }

    /// Produce the next outcome
    pub fn invoke(&self) -> BoxFuture<'static, EngineResult<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        let outcome = match next {
            Some(outcome) => {
                *self.last.lock() = Some(outcome.clone());
                outcome
            }
            None => self
                .last
                .lock()
                .clone()
                .unwrap_or_else(|| Err(EngineError::config("empty operation script"))),
        };
        async move { outcome }.boxed()
    }

    /// Number of invocations so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Outcomes not yet consumed
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}
