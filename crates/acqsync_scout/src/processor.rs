//! Stage plumbing: queues, processors and pipelines.
//!
//! Every long-running component of the agent is a [`Processor`]: it reads
//! from an input [`Queue`], writes to an output [`Queue`] and runs on its
//! own OS thread. A [`Pipeline`] wires stages together by handing the
//! previous stage's output queue to the next stage as its input, so the two
//! stages literally share one queue.
//!
//! ```text
//! Pipeline::source(watcher).then(transfer).then(analyser).start()
//!
//!   [watcher] --q1--> [transfer] --q2--> [analyser] --q3--> output()
//! ```
//!
//! End-of-stream is an explicit marker: when a stage's `run` returns, its
//! output queue is closed and the next stage's `get()` yields `None`.

use crate::cancel::CancellationToken;
use crate::error::{Result, ScoutError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info};

// ============================================================================
// Queue
// ============================================================================

enum Slot<T> {
    Item(T),
    End,
}

/// Outcome of a bounded wait on a [`Queue`].
#[derive(Debug, PartialEq, Eq)]
pub enum Received<T> {
    Item(T),
    Closed,
    TimedOut,
}

/// Unbounded FIFO queue shared between stages.
///
/// Clones are handles to the same queue: any clone may `put`, and `get`
/// calls are serialized so each item is delivered exactly once.
pub struct Queue<T> {
    tx: Sender<Slot<T>>,
    rx: Arc<Mutex<Receiver<Slot<T>>>>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn put(&self, item: T) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        // The receiver lives as long as any handle, so send cannot fail here.
        let _ = self.tx.send(Slot::Item(item));
    }

    /// Append an end-of-stream marker behind everything already queued.
    pub fn close(&self) {
        let _ = self.tx.send(Slot::End);
    }

    /// Block until the next item. `None` means end-of-stream.
    pub fn get(&self) -> Option<T> {
        let rx = self.rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match rx.recv() {
            Ok(slot) => self.unwrap_slot(slot),
            Err(_) => None,
        }
    }

    pub fn get_timeout(&self, timeout: Duration) -> Received<T> {
        let rx = self.rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match rx.recv_timeout(timeout) {
            Ok(slot) => match self.unwrap_slot(slot) {
                Some(item) => Received::Item(item),
                None => Received::Closed,
            },
            Err(RecvTimeoutError::Timeout) => Received::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Received::Closed,
        }
    }

    /// Items waiting in the queue (end markers excluded).
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unwrap_slot(&self, slot: Slot<T>) -> Option<T> {
        match slot {
            Slot::Item(item) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Some(item)
            }
            Slot::End => None,
        }
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Queues and stop flag handed to a running stage.
pub struct StageIo<I, O> {
    pub input: Queue<I>,
    pub output: Queue<O>,
    pub cancel: CancellationToken,
}

/// A pipeline stage.
///
/// `run` owns the stage's thread until it returns. Sources ignore `input`;
/// consumers should return once `input.get()` yields `None`.
pub trait Processor: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn name(&self) -> &str;

    fn run(&mut self, io: &StageIo<Self::Input, Self::Output>) -> std::result::Result<(), Self::Error>;
}

// ============================================================================
// Pipeline
// ============================================================================

type Launch = Box<dyn FnOnce() -> Result<StageHandle> + Send>;

struct StageHandle {
    name: String,
    handle: JoinHandle<Result<()>>,
}

/// Builder that chains stages through shared queues.
pub struct Pipeline<O> {
    launches: Vec<Launch>,
    output: Queue<O>,
    cancel: CancellationToken,
}

impl<O: Send + 'static> Pipeline<O> {
    /// Start a pipeline whose first stage reads from a fresh queue.
    pub fn source<P>(stage: P) -> Pipeline<P::Output>
    where
        P: Processor<Output = O>,
    {
        Self::from_queue(stage, Queue::new(), CancellationToken::new())
    }

    /// Start a pipeline whose first stage reads from `input`, which the
    /// caller keeps feeding (and eventually closes).
    pub fn from_queue<P>(stage: P, input: Queue<P::Input>, cancel: CancellationToken) -> Pipeline<P::Output>
    where
        P: Processor<Output = O>,
    {
        let output = Queue::new();
        let io = StageIo {
            input,
            output: output.clone(),
            cancel: cancel.clone(),
        };
        Pipeline {
            launches: vec![launcher(stage, io)],
            output,
            cancel,
        }
    }

    /// Append a stage that consumes this pipeline's current output.
    pub fn then<P>(mut self, stage: P) -> Pipeline<P::Output>
    where
        P: Processor<Input = O>,
    {
        let output = Queue::new();
        let io = StageIo {
            input: self.output,
            output: output.clone(),
            cancel: self.cancel.clone(),
        };
        self.launches.push(launcher(stage, io));
        Pipeline {
            launches: self.launches,
            output,
            cancel: self.cancel,
        }
    }

    /// Spawn one thread per stage.
    pub fn start(self) -> Result<RunningPipeline<O>> {
        let mut stages = Vec::with_capacity(self.launches.len());
        for launch in self.launches {
            match launch() {
                Ok(stage) => stages.push(stage),
                Err(e) => {
                    // Stop whatever already started before reporting.
                    self.cancel.cancel();
                    return Err(e);
                }
            }
        }
        Ok(RunningPipeline {
            stages,
            output: self.output,
            cancel: self.cancel,
        })
    }
}

fn launcher<P: Processor>(mut stage: P, io: StageIo<P::Input, P::Output>) -> Launch {
    Box::new(move || {
        let name = stage.name().to_string();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!(stage = %thread_name, "Stage started");
                let result = stage.run(&io);
                io.output.close();
                match result {
                    Ok(()) => {
                        info!(stage = %thread_name, "Stage finished");
                        Ok(())
                    }
                    Err(e) => {
                        error!(stage = %thread_name, error = %e, "Stage failed");
                        io.cancel.cancel();
                        Err(ScoutError::Stage {
                            stage: thread_name,
                            source: Box::new(e),
                        })
                    }
                }
            })
            .map_err(|source| ScoutError::Spawn {
                stage: name.clone(),
                source,
            })?;
        Ok(StageHandle { name, handle })
    })
}

/// Handle to started stages.
pub struct RunningPipeline<O> {
    stages: Vec<StageHandle>,
    output: Queue<O>,
    cancel: CancellationToken,
}

impl<O> RunningPipeline<O> {
    /// Output queue of the last stage.
    pub fn output(&self) -> &Queue<O> {
        &self.output
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Ask every stage to wind down. Sources finish their final flush
    /// and close their output, which drains the rest of the chain.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for every stage. Returns the first stage error, in stage order.
    pub fn join(self) -> Result<()> {
        let mut first_error = None;
        for stage in self.stages {
            let outcome = match stage.handle.join() {
                Ok(result) => result,
                Err(_) => Err(ScoutError::StagePanicked(stage.name)),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct StageFailure;

    impl fmt::Display for StageFailure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl std::error::Error for StageFailure {}

    struct Doubler;

    impl Processor for Doubler {
        type Input = u32;
        type Output = u32;
        type Error = StageFailure;

        fn name(&self) -> &str {
            "doubler"
        }

        fn run(&mut self, io: &StageIo<u32, u32>) -> std::result::Result<(), StageFailure> {
            while let Some(n) = io.input.get() {
                io.output.put(n * 2);
            }
            Ok(())
        }
    }

    struct Stringify;

    impl Processor for Stringify {
        type Input = u32;
        type Output = String;
        type Error = StageFailure;

        fn name(&self) -> &str {
            "stringify"
        }

        fn run(&mut self, io: &StageIo<u32, String>) -> std::result::Result<(), StageFailure> {
            while let Some(n) = io.input.get() {
                if n == 666 {
                    return Err(StageFailure);
                }
                io.output.put(n.to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn test_queue_fifo_and_close() {
        let queue = Queue::new();
        queue.put(1);
        queue.put(2);
        queue.close();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get(), Some(1));
        assert_eq!(queue.get(), Some(2));
        assert_eq!(queue.get(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_clone_aliases() {
        let a: Queue<&str> = Queue::new();
        let b = a.clone();
        a.put("x");
        assert_eq!(b.len(), 1);
        assert_eq!(b.get_timeout(Duration::from_millis(10)), Received::Item("x"));
        assert_eq!(a.get_timeout(Duration::from_millis(10)), Received::TimedOut);
    }

    #[test]
    fn test_pipeline_chains_and_propagates_end() {
        let input = Queue::new();
        let running = Pipeline::from_queue(Doubler, input.clone(), CancellationToken::new())
            .then(Stringify)
            .start()
            .unwrap();
        assert_eq!(running.stage_names(), vec!["doubler", "stringify"]);

        for n in 1..=3 {
            input.put(n);
        }
        input.close();

        let mut seen = Vec::new();
        while let Some(s) = running.output().get() {
            seen.push(s);
        }
        assert_eq!(seen, vec!["2", "4", "6"]);
        running.join().unwrap();
    }

    #[test]
    fn test_pipeline_reports_stage_failure() {
        let input = Queue::new();
        let running = Pipeline::from_queue(Doubler, input.clone(), CancellationToken::new())
            .then(Stringify)
            .start()
            .unwrap();

        input.put(333);
        input.close();

        assert_eq!(running.output().get(), None);
        let err = running.join().unwrap_err();
        assert!(matches!(err, ScoutError::Stage { ref stage, .. } if stage == "stringify"));
    }
}
