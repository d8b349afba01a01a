//! Fakes for engine unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;

use beacon_bgp::{ProtocolSession, SessionError, UpdateMessage};
use beacon_core::{Origin, TargetSpec};
use beacon_health::{BoxFuture, HealthProbe, ProbeResult};

pub fn target_spec(name: &str, check: &str) -> TargetSpec {
    TargetSpec {
        name: name.to_string(),
        check: check.to_string(),
        destination: "10.0.0.2".parse().unwrap(),
        prefixes: vec!["192.0.2.10/32".parse().unwrap()],
        med: 0,
        local_pref: 100,
        communities: Vec::new(),
        origin: Origin::Igp,
    }
}

#[derive(Default)]
struct SessionInner {
    established: bool,
    generation: u64,
    fail_sends: bool,
    sent: Vec<UpdateMessage>,
}

/// Scriptable session. Clones share state, so a test keeps one clone while
/// the peer owns another.
#[derive(Clone, Default)]
pub struct FakeSession {
    inner: Arc<Mutex<SessionInner>>,
}

impl FakeSession {
    pub fn established() -> Self {
        let session = Self::default();
        session.set_established(true);
        session
    }

    pub fn set_established(&self, established: bool) {
        let mut inner = self.inner.lock().unwrap();
        if established && !inner.established {
            inner.generation += 1;
        }
        inner.established = established;
    }

    /// Drop and re-establish without anyone observing the gap.
    pub fn reconnect(&self) {
        self.set_established(false);
        self.set_established(true);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.inner.lock().unwrap().fail_sends = fail;
    }

    pub fn sent(&self) -> Vec<UpdateMessage> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.inner.lock().unwrap().sent.clear();
    }
}

impl ProtocolSession for FakeSession {
    fn is_established(&self) -> bool {
        self.inner.lock().unwrap().established
    }

    fn send(&self, update: UpdateMessage) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.established {
            return Err(SessionError::NotEstablished);
        }
        if inner.fail_sends {
            return Err(SessionError::Closed);
        }
        inner.sent.push(update);
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }
}

#[derive(Default)]
struct ProbeInner {
    results: HashMap<String, ProbeResult>,
    runs: Vec<String>,
    delay: Option<Duration>,
}

/// Probe that answers from a table keyed by check string. Unknown checks
/// are `Failed`; the check `"panic"` panics.
#[derive(Clone, Default)]
pub struct ScriptedProbe {
    inner: Arc<Mutex<ProbeInner>>,
}

impl ScriptedProbe {
    pub fn set(&self, check: &str, result: ProbeResult) {
        self.inner
            .lock()
            .unwrap()
            .results
            .insert(check.to_string(), result);
    }

    /// Every probe sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().delay = Some(delay);
    }

    /// Checks probed so far, in completion order.
    pub fn runs(&self) -> Vec<String> {
        self.inner.lock().unwrap().runs.clone()
    }
}

impl HealthProbe for ScriptedProbe {
    fn run<'a>(&'a self, check: &'a str) -> BoxFuture<'a, ProbeResult> {
        async move {
            if check == "panic" {
                panic!("probe exploded");
            }
            let delay = self.inner.lock().unwrap().delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut inner = self.inner.lock().unwrap();
            inner.runs.push(check.to_string());
            inner
                .results
                .get(check)
                .copied()
                .unwrap_or(ProbeResult::Failed)
        }
        .boxed()
    }
}
