// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Dedicated worker threads.
//!
//! The publish dispatcher and every consumer execution loop own one OS thread
//! each. The thread drives a single-threaded tokio runtime so the worker can
//! await channel operations without competing with the caller's runtime.

use crate::errors::AmqpError;
use std::{future::Future, thread::JoinHandle};
use tracing::{debug, error};

pub(crate) fn spawn_worker<F>(name: &str, worker: F) -> Result<JoinHandle<()>, AmqpError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            error!(error = err.to_string(), worker = name, "failure to build worker runtime");
            AmqpError::WorkerSpawnError(name.to_owned())
        })?;

    let thread_name = name.to_owned();
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            runtime.block_on(worker);
            debug!(worker = thread_name, "worker thread stopped");
        })
        .map_err(|err| {
            error!(error = err.to_string(), worker = name, "failure to spawn worker thread");
            AmqpError::WorkerSpawnError(name.to_owned())
        })
}
