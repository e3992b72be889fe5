use crate::context::CloseSignal;
use crate::endpoint::EndpointId;
use crate::error::EvaluationError;
use crate::model::{BindingSet, BindingSetIter};
use crate::pattern::QueryId;
use crossbeam_channel::{Receiver, Sender, bounded, select};
use rayon_core::ThreadPool;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

/// A unit of work of a [`ConcurrentUnion`]: the evaluation of a pattern against one source
pub trait UnionTask: Send + 'static {
    /// The endpoint the task queries
    fn endpoint(&self) -> &EndpointId;

    /// Starts the evaluation.
    ///
    /// It is called on a worker thread, the returned stream is consumed there too.
    fn evaluate(self) -> Result<BindingSetIter, EvaluationError>;
}

type TaskFn = Box<dyn FnOnce() -> Result<BindingSetIter, EvaluationError> + Send>;

struct PendingTask {
    endpoint: EndpointId,
    evaluate: TaskFn,
}

/// Collects the tasks of a [`ConcurrentUnion`].
///
/// Built from [`FederationContext::create_union`](crate::FederationContext::create_union).
#[must_use]
pub struct UnionBuilder {
    query: QueryId,
    pool: Arc<ThreadPool>,
    buffer: usize,
    query_cancellation: CloseSignal,
    running_tasks: Arc<AtomicUsize>,
    tasks: Vec<PendingTask>,
}

impl UnionBuilder {
    pub(crate) fn new(
        query: QueryId,
        pool: Arc<ThreadPool>,
        buffer: usize,
        query_cancellation: CloseSignal,
        running_tasks: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            query,
            pool,
            buffer,
            query_cancellation,
            running_tasks,
            tasks: Vec::new(),
        }
    }

    pub fn add_task(&mut self, task: impl UnionTask) {
        self.tasks.push(PendingTask {
            endpoint: task.endpoint().clone(),
            evaluate: Box::new(move || task.evaluate()),
        });
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawns all the tasks and returns the union of their results
    pub fn build(self) -> ConcurrentUnion {
        let (sender, receiver) = bounded(self.buffer);
        let cancellation = CloseSignal::new();
        debug!(query = %self.query, tasks = self.tasks.len(), "starting union");
        for task in self.tasks {
            let worker = Worker {
                query: self.query,
                sender: sender.clone(),
                cancellation: cancellation.clone(),
                query_cancellation: self.query_cancellation.clone(),
                _running: RunningTask::new(Arc::clone(&self.running_tasks)),
            };
            self.pool.spawn(move || worker.run(task));
        }
        // The channel gets disconnected when the last task finishes
        drop(sender);
        ConcurrentUnion {
            receiver: Some(receiver),
            state: UnionState::Open,
            cancellation,
            query_cancellation: self.query_cancellation,
        }
    }
}

struct Worker {
    query: QueryId,
    sender: Sender<Result<BindingSet, EvaluationError>>,
    cancellation: CloseSignal,
    query_cancellation: CloseSignal,
    _running: RunningTask,
}

impl Worker {
    fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled() || self.query_cancellation.is_cancelled()
    }

    fn run(self, task: PendingTask) {
        if self.is_cancelled() {
            trace!(query = %self.query, endpoint = %task.endpoint, "union closed before the task started");
            return;
        }
        trace!(query = %self.query, endpoint = %task.endpoint, "union task started");
        let endpoint = task.endpoint;
        let evaluate = task.evaluate;
        let outcome = catch_unwind(AssertUnwindSafe(|| self.forward(evaluate)));
        match outcome {
            Ok(Ok(count)) => {
                trace!(query = %self.query, endpoint = %endpoint, count, "union task finished");
            }
            Ok(Err(error)) => {
                warn!(query = %self.query, endpoint = %endpoint, %error, "union task failed");
                self.send(Err(error));
            }
            Err(_) => {
                warn!(query = %self.query, endpoint = %endpoint, "union task panicked");
                self.send(Err(EvaluationError::source(
                    endpoint,
                    "the evaluation task panicked",
                )));
            }
        }
    }

    /// Sends the task results to the union, returns the number of binding sets sent
    fn forward(&self, evaluate: TaskFn) -> Result<usize, EvaluationError> {
        let mut count = 0;
        for result in evaluate()? {
            if self.is_cancelled() {
                break;
            }
            let bindings = result?;
            if !self.send(Ok(bindings)) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Returns `false` if the union does not accept results anymore
    fn send(&self, result: Result<BindingSet, EvaluationError>) -> bool {
        let sent = select! {
            send(self.sender, result) -> sent => sent.is_ok(),
            recv(self.cancellation.closed()) -> _ => false,
            recv(self.query_cancellation.closed()) -> _ => false,
        };
        if !sent {
            trace!(query = %self.query, "union already closed");
        }
        sent
    }
}

/// Counts the tasks that are not finished
struct RunningTask(Arc<AtomicUsize>);

impl RunningTask {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The state of a [`ConcurrentUnion`]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnionState {
    /// Results might still come
    Open,
    /// All the tasks finished and all their results have been consumed
    Drained,
    /// The union has been closed before the end of its tasks
    Closed,
    /// A task failed, the error has been returned
    Failed,
}

/// Runs a set of tasks concurrently and streams their results as they arrive.
///
/// There is no ordering between the results of different tasks.
/// The first task error is returned once, then the union is closed:
/// the other tasks are cancelled and their pending results are discarded.
/// [`close`](Self::close) is idempotent and is called on drop.
pub struct ConcurrentUnion {
    receiver: Option<Receiver<Result<BindingSet, EvaluationError>>>,
    state: UnionState,
    cancellation: CloseSignal,
    query_cancellation: CloseSignal,
}

impl ConcurrentUnion {
    #[inline]
    pub fn state(&self) -> UnionState {
        self.state
    }

    /// Stops the union: the tasks are cancelled and no result is returned anymore
    pub fn close(&mut self) {
        if self.state == UnionState::Open {
            self.state = UnionState::Closed;
        }
        self.cancellation.cancel();
        // Dropping the receiver unblocks the tasks waiting for buffer space
        self.receiver = None;
    }

    /// Returns a handle allowing to close the union from an other thread
    pub fn handle(&self) -> UnionHandle {
        UnionHandle {
            cancellation: self.cancellation.clone(),
        }
    }

    fn fail(&mut self, error: EvaluationError) -> Option<Result<BindingSet, EvaluationError>> {
        self.close();
        self.state = UnionState::Failed;
        Some(Err(error))
    }
}

impl Iterator for ConcurrentUnion {
    type Item = Result<BindingSet, EvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.query_cancellation.is_cancelled() && self.state == UnionState::Open {
            return self.fail(EvaluationError::Cancelled);
        }
        if self.cancellation.is_cancelled() {
            self.close();
            return None;
        }
        let receiver = self.receiver.as_ref()?;
        let received = select! {
            recv(receiver) -> received => Some(received),
            recv(self.cancellation.closed()) -> _ => None,
            recv(self.query_cancellation.closed()) -> _ => None,
        };
        if self.cancellation.is_cancelled() {
            // Closed through a handle while waiting
            self.close();
            return None;
        }
        let Some(received) = received else {
            return self.fail(EvaluationError::Cancelled);
        };
        match received {
            Ok(Ok(bindings)) => Some(Ok(bindings)),
            Ok(Err(error)) => self.fail(error),
            Err(_) => {
                if self.query_cancellation.is_cancelled() {
                    return self.fail(EvaluationError::Cancelled);
                }
                self.receiver = None;
                self.state = UnionState::Drained;
                None
            }
        }
    }
}

impl Drop for ConcurrentUnion {
    fn drop(&mut self) {
        self.close();
    }
}

impl From<ConcurrentUnion> for BindingSetIter {
    #[inline]
    fn from(union: ConcurrentUnion) -> Self {
        Self::new(union)
    }
}

/// Allows to close a [`ConcurrentUnion`] from an other thread.
///
/// Results still buffered are discarded: the union returns `None` from its next call.
#[derive(Clone)]
pub struct UnionHandle {
    cancellation: CloseSignal,
}

impl UnionHandle {
    pub fn close(&self) {
        self.cancellation.cancel();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
#[expect(clippy::panic_in_result_fn)]
mod tests {
    use super::*;
    use crate::context::{FederationContext, FederationManager, FederationOptions};
    use crate::endpoint::EndpointManager;
    use oxrdf::{Literal, Term, Variable};
    use std::error::Error;
    use std::iter::repeat_with;
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    struct RowsTask {
        endpoint: EndpointId,
        rows: Vec<Result<BindingSet, EvaluationError>>,
    }

    impl UnionTask for RowsTask {
        fn endpoint(&self) -> &EndpointId {
            &self.endpoint
        }

        fn evaluate(self) -> Result<BindingSetIter, EvaluationError> {
            Ok(BindingSetIter::new(self.rows))
        }
    }

    struct EndlessTask(EndpointId);

    impl UnionTask for EndlessTask {
        fn endpoint(&self) -> &EndpointId {
            &self.0
        }

        fn evaluate(self) -> Result<BindingSetIter, EvaluationError> {
            Ok(BindingSetIter::new(repeat_with(|| Ok(BindingSet::new()))))
        }
    }

    struct FailingTask(EndpointId);

    impl UnionTask for FailingTask {
        fn endpoint(&self) -> &EndpointId {
            &self.0
        }

        fn evaluate(self) -> Result<BindingSetIter, EvaluationError> {
            Err(EvaluationError::source(self.0, "connection refused"))
        }
    }

    /// Answers a single row after a delay
    struct SlowTask(EndpointId, Duration);

    impl UnionTask for SlowTask {
        fn endpoint(&self) -> &EndpointId {
            &self.0
        }

        fn evaluate(self) -> Result<BindingSetIter, EvaluationError> {
            sleep(self.1);
            Ok(BindingSetIter::single(BindingSet::new()))
        }
    }

    fn context(buffer: usize) -> Result<FederationContext, EvaluationError> {
        Ok(FederationManager::new(
            Arc::new(EndpointManager::new()),
            FederationOptions {
                worker_threads: Some(4),
                union_buffer: buffer,
            },
        )?
        .begin_query("test"))
    }

    fn row(i: i32) -> Result<BindingSet, Box<dyn Error>> {
        Ok(BindingSet::new().with(Variable::new("x")?, Literal::from(i)))
    }

    fn wait_for_tasks(context: &FederationContext) {
        let start = Instant::now();
        while context.running_tasks() > 0 && start.elapsed() < Duration::from_secs(10) {
            sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn empty_union_is_drained() -> Result<(), Box<dyn Error>> {
        let mut union = context(8)?.create_union().build();
        assert!(union.next().is_none());
        assert_eq!(union.state(), UnionState::Drained);
        Ok(())
    }

    #[test]
    fn union_returns_all_rows() -> Result<(), Box<dyn Error>> {
        let context = context(2)?;
        let mut builder = context.create_union();
        builder.add_task(RowsTask {
            endpoint: "a".into(),
            rows: vec![Ok(row(1)?), Ok(row(2)?), Ok(row(3)?)],
        });
        builder.add_task(RowsTask {
            endpoint: "b".into(),
            rows: Vec::new(),
        });
        builder.add_task(RowsTask {
            endpoint: "c".into(),
            rows: vec![Ok(row(4)?)],
        });
        let mut values = builder
            .build()
            .map(|r| Ok(r?["x"].clone()))
            .collect::<Result<Vec<_>, EvaluationError>>()?;
        values.sort_by_key(ToString::to_string);
        assert_eq!(
            values,
            [1, 2, 3, 4].map(|i| Term::from(Literal::from(i))).to_vec()
        );
        Ok(())
    }

    #[test]
    fn first_error_closes_union() -> Result<(), Box<dyn Error>> {
        let context = context(4)?;
        let mut builder = context.create_union();
        builder.add_task(EndlessTask("endless".into()));
        builder.add_task(FailingTask("failing".into()));
        let mut union = builder.build();
        let mut errors = 0;
        for result in union.by_ref() {
            if result.is_err() {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(union.state(), UnionState::Failed);
        assert!(union.next().is_none());
        wait_for_tasks(&context);
        assert_eq!(context.running_tasks(), 0);
        Ok(())
    }

    #[test]
    fn close_stops_endless_tasks() -> Result<(), Box<dyn Error>> {
        let context = context(4)?;
        let mut builder = context.create_union();
        builder.add_task(EndlessTask("a".into()));
        builder.add_task(EndlessTask("b".into()));
        let mut union = builder.build();
        assert!(union.next().is_some());
        union.close();
        union.close();
        assert_eq!(union.state(), UnionState::Closed);
        assert!(union.next().is_none());
        wait_for_tasks(&context);
        assert_eq!(context.running_tasks(), 0);
        Ok(())
    }

    #[test]
    fn handle_closes_from_an_other_thread() -> Result<(), Box<dyn Error>> {
        let context = context(4)?;
        let mut builder = context.create_union();
        builder.add_task(EndlessTask("a".into()));
        let mut union = builder.build();
        let handle = union.handle();
        std::thread::spawn(move || handle.close()).join().map_err(|_| "thread panicked")?;
        assert!(union.next().is_none());
        assert_eq!(union.state(), UnionState::Closed);
        Ok(())
    }

    #[test]
    fn query_cancellation_is_reported() -> Result<(), Box<dyn Error>> {
        let context = context(4)?;
        let mut builder = context.create_union();
        builder.add_task(EndlessTask("a".into()));
        let mut union = builder.build();
        context.cancel();
        assert!(matches!(union.next(), Some(Err(EvaluationError::Cancelled))));
        assert!(union.next().is_none());
        wait_for_tasks(&context);
        assert_eq!(context.running_tasks(), 0);
        Ok(())
    }

    #[test]
    fn handle_close_wakes_up_a_waiting_consumer() -> Result<(), Box<dyn Error>> {
        let context = context(4)?;
        let mut builder = context.create_union();
        builder.add_task(SlowTask("slow".into(), Duration::from_secs(5)));
        let mut union = builder.build();
        let handle = union.handle();
        let closer = std::thread::spawn(move || {
            sleep(Duration::from_millis(50));
            handle.close();
        });
        let start = Instant::now();
        assert!(union.next().is_none());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(union.state(), UnionState::Closed);
        closer.join().map_err(|_| "thread panicked")?;
        Ok(())
    }

    #[test]
    fn query_cancellation_wakes_up_a_waiting_consumer() -> Result<(), Box<dyn Error>> {
        let context = context(4)?;
        let mut builder = context.create_union();
        builder.add_task(SlowTask("slow".into(), Duration::from_secs(5)));
        let mut union = builder.build();
        let canceller = {
            let context = context.clone();
            std::thread::spawn(move || {
                sleep(Duration::from_millis(50));
                context.cancel();
            })
        };
        let start = Instant::now();
        assert!(matches!(union.next(), Some(Err(EvaluationError::Cancelled))));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(union.next().is_none());
        canceller.join().map_err(|_| "thread panicked")?;
        Ok(())
    }
}
