/*!
Scripted decision oracle

Replays queued replies (answer, failure, or a hang) with an optional delay,
then falls back to a default reply. Counts calls and keeps every request so
tests can assert on single-flight behaviour.
*/

use futures::future::BoxFuture;
use futures::FutureExt;
use irrigation_kernel::oracle::{AdapterError, DecisionOracle, DecisionRequest};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Reply {
    /// Raw text returned to the adapter, e.g. "1" or `{"action": 0}`
    Answer(String),
    /// Behaves like a non-zero exit
    Fail,
    /// Never answers; only the adapter timeout ends it
    Hang,
}

impl Reply {
    pub fn start() -> Self {
        Reply::Answer("1".into())
    }

    pub fn stop() -> Self {
        Reply::Answer("0".into())
    }
}

pub struct ScriptedOracle {
    script: Mutex<VecDeque<(Reply, Duration)>>,
    fallback: Reply,
    requests: Mutex<Vec<DecisionRequest>>,
}

impl ScriptedOracle {
    pub fn new(fallback: Reply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues one reply, served after `delay`.
    pub fn then(self, reply: Reply, delay: Duration) -> Self {
        self.push(reply, delay);
        self
    }

    pub fn push(&self, reply: Reply, delay: Duration) {
        self.script.lock().unwrap().push_back((reply, delay));
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<DecisionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new(Reply::stop())
    }
}

impl DecisionOracle for ScriptedOracle {
    fn query(&self, request: DecisionRequest) -> BoxFuture<'static, Result<String, AdapterError>> {
        self.requests.lock().unwrap().push(request);
        let (reply, delay) = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (self.fallback.clone(), Duration::ZERO));

        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match reply {
                Reply::Answer(text) => Ok(text),
                Reply::Fail => Err(AdapterError::ExitStatus(Some(1))),
                Reply::Hang => futures::future::pending().await,
            }
        }
        .boxed()
    }
}
