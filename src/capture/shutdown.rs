// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;

use super::FlushError;

/// The end-of-life action of a capture session. Consuming `self` makes a
/// second completion of the same session impossible.
#[async_trait]
pub(crate) trait Completion: Send {
    /// Where the session writes to, for logging.
    fn name(&self) -> &str;
    async fn complete(self: Box<Self>) -> Result<(), FlushError>;
}

enum State {
    Open(Vec<Box<dyn Completion>>),
    Closed,
}

/// Result of running the registered completions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Sessions whose data was written.
    pub flushed: usize,
    /// Sessions whose data was lost.
    pub lost: usize,
}

/// Completions to run once, at the end of the process.
pub(crate) struct ShutdownRegistry {
    state: Mutex<State>,
}

impl ShutdownRegistry {
    pub(crate) fn new() -> Self {
        ShutdownRegistry {
            state: Mutex::new(State::Open(Vec::new())),
        }
    }

    /// Hands the completion back if the registry already ran.
    pub(crate) fn register(
        &self,
        completion: Box<dyn Completion>,
    ) -> Result<(), Box<dyn Completion>> {
        match &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            State::Open(pending) => {
                pending.push(completion);
                Ok(())
            }
            State::Closed => Err(completion),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            State::Closed
        )
    }

    pub(crate) fn pending(&self) -> usize {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            State::Open(pending) => pending.len(),
            State::Closed => 0,
        }
    }

    /// Runs every registered completion concurrently. Only the first call
    /// does anything; failures are logged and counted, never returned.
    pub(crate) async fn run(&self) -> ShutdownSummary {
        let pending = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, State::Closed) {
                State::Open(pending) => pending,
                State::Closed => return ShutdownSummary::default(),
            }
        };
        let results = futures::future::join_all(pending.into_iter().map(|completion| async move {
            let name = completion.name().to_owned();
            match completion.complete().await {
                Ok(()) => {
                    tracing::debug!(message = "flushed capture session", session = %name);
                    true
                }
                Err(err) => {
                    tracing::error!(?err, session = %name, "unable to flush capture session, samples lost");
                    false
                }
            }
        }))
        .await;
        let flushed = results.iter().filter(|ok| **ok).count();
        ShutdownSummary {
            flushed,
            lost: results.len() - flushed,
        }
    }
}

impl fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}
