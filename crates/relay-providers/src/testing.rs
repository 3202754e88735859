//! Scripted in-memory transport for tests.
//!
//! Each `send` consumes the next scripted step and records the request it
//! was given, so tests can assert both on outcomes and on what went out.

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{CancellationToken, RelayError, Transport, TransportRequest, TransportResponse};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug)]
enum Step {
    Respond(TransportResponse),
    Fail(RelayError),
    Delayed(Duration, TransportResponse),
    Hang,
}

/// A [`Transport`] that replays a script
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    /// Create an empty script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response
    #[must_use]
    pub fn respond(self, status: u16, body: impl Into<String>) -> Self {
        self.push(Step::Respond(TransportResponse::new(status, body)))
    }

    /// Queue a fully specified response
    #[must_use]
    pub fn respond_with(self, response: TransportResponse) -> Self {
        self.push(Step::Respond(response))
    }

    /// Queue a response delivered after `delay`
    #[must_use]
    pub fn respond_after(self, delay: Duration, status: u16, body: impl Into<String>) -> Self {
        self.push(Step::Delayed(delay, TransportResponse::new(status, body)))
    }

    /// Queue a transport failure
    #[must_use]
    pub fn fail(self, error: RelayError) -> Self {
        self.push(Step::Fail(error))
    }

    /// Queue a request that never completes unless aborted
    #[must_use]
    pub fn hang(self) -> Self {
        self.push(Step::Hang)
    }

    fn push(self, step: Step) -> Self {
        self.steps.lock().push_back(step);
        self
    }

    /// Requests received so far
    #[must_use]
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Steps not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.steps.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: TransportRequest,
        abort: Option<&CancellationToken>,
    ) -> Result<TransportResponse, RelayError> {
        self.requests.lock().push(request);
        let step = self.steps.lock().pop_front();

        let wait = async {
            match step {
                Some(Step::Respond(response)) => Ok(response),
                Some(Step::Fail(error)) => Err(error),
                Some(Step::Delayed(delay, response)) => {
                    tokio::time::sleep(delay).await;
                    Ok(response)
                }
                Some(Step::Hang) => std::future::pending().await,
                None => Err(RelayError::transport("no scripted response left")),
            }
        };

        match abort {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => Err(RelayError::cancelled(token.reason().unwrap_or_default())),
                result = wait => result,
            },
            None => wait.await,
        }
    }
}
