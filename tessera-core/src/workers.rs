use crate::{Error, Result, util::lock};
use flume::TrySendError;
use futures::future::BoxFuture;
use std::{
    future::Future,
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
};
use tokio::{sync::oneshot, task::JoinHandle};

type Task = BoxFuture<'static, ()>;

/// Fixed set of tasks draining a bounded queue of fire and forget work.
///
/// A submission finding the queue full runs on the caller instead of being
/// rejected.
pub struct AsyncWorkers {
    sender: Mutex<Option<flume::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncWorkers {
    /// Must be called from within a tokio runtime.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded::<Task>(capacity.max(1));
        let workers = (0..workers.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    while let Ok(task) = receiver.recv_async().await {
                        task.await;
                    }
                })
            })
            .collect();
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue `task`, or run it to completion here when the queue is full or closed.
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task: Task = Box::pin(task);
        let sender = lock(&self.sender).clone();
        let task = match sender {
            Some(sender) => match sender.try_send(task) {
                Ok(()) => return,
                Err(TrySendError::Full(task)) => {
                    log::debug!("Async queue is full, running the task on the caller");
                    task
                }
                Err(TrySendError::Disconnected(task)) => task,
            },
            None => task,
        };
        task.await;
    }

    /// Stop accepting work and wait for the queued tasks to complete.
    pub async fn shutdown(&self) {
        lock(&self.sender).take();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                log::error!("Async worker terminated abnormally: {:#}", e);
            }
        }
    }
}

/// Completion of a save submitted through [`AsyncWorkers`].
pub struct SaveHandle<E> {
    receiver: oneshot::Receiver<Result<E>>,
}

impl<E> SaveHandle<E> {
    pub fn new(receiver: oneshot::Receiver<Result<E>>) -> Self {
        Self { receiver }
    }
}

impl<E> Future for SaveHandle<E> {
    type Output = Result<E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(Error::msg("The save task was dropped before completing")))
        })
    }
}
