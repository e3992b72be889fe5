use crate::endpoint::EndpointRegistry;
use crate::error::EvaluationError;
use crate::pattern::{QueryId, QueryInfo};
use crate::union::UnionBuilder;
use crossbeam_channel::{Receiver, Sender, bounded};
use rayon_core::{ThreadPool, ThreadPoolBuilder};
use spareval::CancellationToken;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::available_parallelism;
use tracing::{debug, error};

/// Default capacity of the buffer between the union tasks and the union consumer
pub const DEFAULT_UNION_BUFFER: usize = 1024;

/// A cancellation flag that also wakes up the threads waiting on [`closed`](Self::closed).
///
/// The flag itself is a [`CancellationToken`] so it can be handed to [`spareval`].
#[derive(Clone)]
pub(crate) struct CloseSignal {
    token: CancellationToken,
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            token: CancellationToken::new(),
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
        // Dropping the only sender disconnects the channel
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[inline]
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A channel that never gets any message and is disconnected on cancellation
    #[inline]
    pub(crate) fn closed(&self) -> &Receiver<()> {
        &self.receiver
    }
}

/// Options of a [`FederationManager`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FederationOptions {
    /// Number of threads evaluating the union tasks, the available parallelism by default
    pub worker_threads: Option<usize>,
    /// Maximal number of binding sets waiting to be consumed per union
    pub union_buffer: usize,
}

impl Default for FederationOptions {
    fn default() -> Self {
        Self {
            worker_threads: None,
            union_buffer: DEFAULT_UNION_BUFFER,
        }
    }
}

/// Owns the resources shared by the evaluation of all federated queries: the endpoint registry and the worker pool.
///
/// Each query evaluation gets its own [`FederationContext`] from [`begin_query`](Self::begin_query).
pub struct FederationManager {
    registry: Arc<dyn EndpointRegistry>,
    pool: Arc<ThreadPool>,
    options: FederationOptions,
}

impl FederationManager {
    pub fn new(
        registry: Arc<dyn EndpointRegistry>,
        options: FederationOptions,
    ) -> Result<Self, EvaluationError> {
        let worker_threads = options
            .worker_threads
            .or_else(|| available_parallelism().ok().map(Into::into))
            .unwrap_or(4);
        let pool = ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .thread_name(|i| format!("sparfed-worker-{i}"))
            .panic_handler(|_| error!("a federation worker panicked"))
            .build()
            .map_err(|e| EvaluationError::Unexpected(Box::new(e)))?;
        debug!(worker_threads, "federation worker pool started");
        Ok(Self {
            registry,
            pool: Arc::new(pool),
            options,
        })
    }

    #[inline]
    pub fn registry(&self) -> &Arc<dyn EndpointRegistry> {
        &self.registry
    }

    #[inline]
    pub fn options(&self) -> &FederationOptions {
        &self.options
    }

    /// Starts the evaluation of a new federated query
    pub fn begin_query(&self, query: impl Into<Arc<str>>) -> FederationContext {
        let info = QueryInfo::new(query);
        debug!(query = %info.id(), "federated query started");
        FederationContext {
            inner: Arc::new(ContextInner {
                info,
                registry: Arc::clone(&self.registry),
                pool: Arc::clone(&self.pool),
                union_buffer: self.options.union_buffer.max(1),
                cancellation: CloseSignal::new(),
                running_tasks: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }
}

/// The evaluation context of one federated query.
///
/// It hands out the [`ConcurrentUnion`](crate::ConcurrentUnion)s of the query so that all the tasks
/// spawned for it can be tracked and cancelled together.
#[derive(Clone)]
pub struct FederationContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    info: QueryInfo,
    registry: Arc<dyn EndpointRegistry>,
    pool: Arc<ThreadPool>,
    union_buffer: usize,
    cancellation: CloseSignal,
    running_tasks: Arc<AtomicUsize>,
}

impl FederationContext {
    #[inline]
    pub fn query_info(&self) -> &QueryInfo {
        &self.inner.info
    }

    #[inline]
    pub fn query_id(&self) -> QueryId {
        self.inner.info.id()
    }

    #[inline]
    pub fn registry(&self) -> &dyn EndpointRegistry {
        &*self.inner.registry
    }

    /// Starts building a new union for this query
    pub fn create_union(&self) -> UnionBuilder {
        UnionBuilder::new(
            self.query_id(),
            Arc::clone(&self.inner.pool),
            self.inner.union_buffer,
            self.inner.cancellation.clone(),
            Arc::clone(&self.inner.running_tasks),
        )
    }

    /// Cancels all the unions created for this query
    pub fn cancel(&self) {
        debug!(query = %self.query_id(), "federated query cancelled");
        self.inner.cancellation.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// The token set by [`cancel`](Self::cancel).
    ///
    /// Cancelling the token directly does not wake up the consumers blocked on a union, use [`cancel`](Self::cancel) instead.
    #[inline]
    pub fn cancellation_token(&self) -> &CancellationToken {
        self.inner.cancellation.token()
    }

    /// Number of union tasks spawned for this query that have not finished yet
    #[inline]
    pub fn running_tasks(&self) -> usize {
        self.inner.running_tasks.load(Ordering::Acquire)
    }
}
