//! Fixed-size worker pool fed by a bounded queue.
//!
//! Front-ends enqueue [`BookingRequest`]s and await the outcome; `workers` tokio
//! tasks share one receiver and call the orchestrator. The queue bound is the
//! backpressure: [`PoolHandle::try_submit`] fails fast when it is full, while
//! [`PoolHandle::submit`] waits for room.
//!
//! Shutdown closes the queue, lets the workers drain what was already accepted,
//! then joins them.

use crate::orchestrator::ReservationOrchestrator;
use seatguard_core::outcome::{ReservationError, ReservationOutcome};
use seatguard_core::resource::{RequesterId, ResourceId, ResourcePool};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// What a booking request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingTarget {
    /// One specific resource.
    Resource(ResourceId),
    /// Any free member of the pool.
    Pool(ResourcePool),
}

/// A unit of work for the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    /// Who is asking.
    pub requester: RequesterId,
    /// For what.
    pub target: BookingTarget,
}

impl BookingRequest {
    /// Request one specific resource.
    #[must_use]
    pub const fn resource(requester: RequesterId, resource: ResourceId) -> Self {
        Self {
            requester,
            target: BookingTarget::Resource(resource),
        }
    }

    /// Request any member of a pool.
    #[must_use]
    pub const fn any_of(requester: RequesterId, pool: ResourcePool) -> Self {
        Self {
            requester,
            target: BookingTarget::Pool(pool),
        }
    }
}

/// Errors from submitting to the pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The pool is shut down (or shutting down) and accepts no more work.
    #[error("Worker pool is closed")]
    Closed,
    /// The queue is at capacity.
    #[error("Worker pool queue is full")]
    QueueFull,
}

#[derive(Debug)]
struct Job {
    request: BookingRequest,
    reply: oneshot::Sender<ReservationOutcome>,
}

/// A request accepted into the queue, not yet answered.
#[derive(Debug)]
pub struct PendingBooking {
    answer: oneshot::Receiver<ReservationOutcome>,
}

impl PendingBooking {
    /// Wait for the worker's answer.
    ///
    /// If the worker disappears without answering, the outcome is
    /// `Error(WorkerUnavailable)`.
    pub async fn outcome(self) -> ReservationOutcome {
        self.answer.await.unwrap_or_else(|_| {
            ReservationOutcome::Error(ReservationError::WorkerUnavailable(
                "worker dropped the request without answering".to_string(),
            ))
        })
    }
}

/// Cloneable submission side of a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolHandle {
    sender: mpsc::Sender<Job>,
}

impl PoolHandle {
    /// Enqueue, waiting for room if the queue is full, then await the outcome.
    ///
    /// # Errors
    ///
    /// `Closed` once the pool is shutting down.
    pub async fn submit(&self, request: BookingRequest) -> Result<ReservationOutcome, PoolError> {
        let (reply, answer) = oneshot::channel();
        self.sender
            .send(Job { request, reply })
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(PendingBooking { answer }.outcome().await)
    }

    /// Enqueue without waiting.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the queue is at capacity, `Closed` once the pool is
    /// shutting down.
    pub fn try_submit(&self, request: BookingRequest) -> Result<PendingBooking, PoolError> {
        let (reply, answer) = oneshot::channel();
        self.sender
            .try_send(Job { request, reply })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => PoolError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
            })?;
        Ok(PendingBooking { answer })
    }
}

/// Worker tasks sharing one bounded queue.
#[derive(Debug)]
pub struct WorkerPool {
    handle: PoolHandle,
    closing: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` tasks behind a queue of `queue_depth` requests.
    ///
    /// Both sizes are raised to at least 1.
    #[must_use]
    pub fn spawn(
        orchestrator: Arc<ReservationOrchestrator>,
        workers: usize,
        queue_depth: usize,
    ) -> Self {
        let worker_count = workers.max(1);
        let queue_depth = queue_depth.max(1);
        let (sender, receiver) = mpsc::channel(queue_depth);
        let queue = Arc::new(Mutex::new(receiver));
        let (closing, closing_rx) = watch::channel(false);

        let workers = (0..worker_count)
            .map(|id| {
                tokio::spawn(work(
                    id,
                    Arc::clone(&orchestrator),
                    Arc::clone(&queue),
                    closing_rx.clone(),
                ))
            })
            .collect();

        tracing::info!(workers = worker_count, queue_depth, "Worker pool started");
        Self {
            handle: PoolHandle { sender },
            closing,
            workers,
        }
    }

    /// Start a pool sized by the orchestrator's configuration.
    #[must_use]
    pub fn from_config(orchestrator: Arc<ReservationOrchestrator>) -> Self {
        let (workers, queue_depth) = {
            let config = orchestrator.config();
            (config.workers, config.queue_depth)
        };
        Self::spawn(orchestrator, workers, queue_depth)
    }

    /// A cloneable submission handle.
    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// See [`PoolHandle::submit`].
    ///
    /// # Errors
    ///
    /// `Closed` once the pool is shutting down.
    pub async fn submit(&self, request: BookingRequest) -> Result<ReservationOutcome, PoolError> {
        self.handle.submit(request).await
    }

    /// See [`PoolHandle::try_submit`].
    ///
    /// # Errors
    ///
    /// `QueueFull` or `Closed`.
    pub fn try_submit(&self, request: BookingRequest) -> Result<PendingBooking, PoolError> {
        self.handle.try_submit(request)
    }

    /// Close the queue, drain accepted requests and join every worker.
    pub async fn shutdown(self) {
        self.closing.send_replace(true);
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "Worker task failed");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn work(
    id: usize,
    orchestrator: Arc<ReservationOrchestrator>,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    mut closing: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut receiver = queue.lock().await;
            tokio::select! {
                biased;
                job = receiver.recv() => job,
                _ = closing.changed() => {
                    // Refuse new work; what is buffered is still handed out.
                    receiver.close();
                    receiver.recv().await
                }
            }
        };
        let Some(Job { request, reply }) = next else {
            break;
        };

        let outcome = match &request.target {
            BookingTarget::Resource(resource) => {
                orchestrator.reserve(&request.requester, resource).await
            }
            BookingTarget::Pool(pool) => orchestrator.reserve_any(&request.requester, pool).await,
        };
        if reply.send(outcome).is_err() {
            tracing::debug!(worker = id, requester = %request.requester, "Submitter went away before the answer");
        }
    }
    tracing::debug!(worker = id, "Worker drained and stopped");
}
