// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Execution Loop
//!
//! Decouples the driver's delivery path, which must return quickly, from
//! application handlers that may be slow. Each loop owns one worker thread and
//! one unbounded FIFO queue of handling actions; actions run strictly one at a
//! time in the order they were queued, which gives a single consumer in-order,
//! non-overlapping handler execution.

use crate::{errors::AmqpError, worker::spawn_worker};
use futures_util::{future::BoxFuture, FutureExt};
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    thread::JoinHandle,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

/// A queued unit of delivery handling work.
pub type HandleAction = BoxFuture<'static, ()>;

pub struct ConsumerLoop {
    name: String,
    running: AtomicBool,
    sender: Mutex<Option<UnboundedSender<HandleAction>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerLoop {
    /// Starts a loop whose worker thread is named `name`.
    pub fn start(name: &str) -> Result<Self, AmqpError> {
        let (sender, receiver) = unbounded_channel();
        let worker = spawn_worker(name, run(name.to_owned(), receiver))?;

        Ok(ConsumerLoop {
            name: name.to_owned(),
            running: AtomicBool::new(true),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queues an action for execution on the worker.
    pub fn queue_message_handle_action(&self, action: HandleAction) -> Result<(), AmqpError> {
        if !self.is_running() {
            return Err(AmqpError::LoopStopped);
        }

        match self.sender().as_ref() {
            Some(sender) => sender.send(action).map_err(|_| AmqpError::LoopStopped),
            None => Err(AmqpError::LoopStopped),
        }
    }

    /// Closes the queue to new actions. The worker drains what is already
    /// queued and then exits.
    pub fn dispose(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.sender().take();
        debug!(consumer_loop = self.name, "consumer loop disposed");
    }

    /// Waits for the worker thread to exit. Must not be called from an action.
    pub fn join(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!(consumer_loop = self.name, "consumer loop worker panicked");
            }
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<UnboundedSender<HandleAction>>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ConsumerLoop {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn run(name: String, mut receiver: UnboundedReceiver<HandleAction>) {
    while let Some(action) = receiver.recv().await {
        if AssertUnwindSafe(action).catch_unwind().await.is_err() {
            error!(consumer_loop = name, "message handle action panicked");
        }
    }

    debug!(consumer_loop = name, "consumer loop stopped");
}
