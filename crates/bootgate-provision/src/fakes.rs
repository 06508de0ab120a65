//! In-memory backend fake (testing only)
//!
//! `RecordingBackend` satisfies the [`ProvisionBackend`] contract without
//! building anything: every environment shares one host directory, and the
//! backend keeps an ordered log of provision/teardown calls so tests can
//! assert on lifecycle ordering and exactly-once teardown.

use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bootgate_core::ProvisioningSpec;
use tokio::sync::watch;

use crate::error::{ProvisionError, ProvisionResult};
use crate::{Environment, ProvisionBackend};

/// One lifecycle call observed by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Provisioned(String),
    TornDown(String),
}

#[derive(Debug)]
pub struct RecordingBackend {
    root: PathBuf,
    delay: Duration,
    failures: Mutex<VecDeque<ProvisionError>>,
    counter: AtomicU32,
    provisions: AtomicU32,
    teardowns: AtomicU32,
    live: Mutex<BTreeSet<String>>,
    live_count: watch::Sender<usize>,
    events: Mutex<Vec<BackendEvent>>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    pub fn new() -> Self {
        let (live_count, _) = watch::channel(0);
        Self {
            root: std::env::temp_dir(),
            delay: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            counter: AtomicU32::new(0),
            provisions: AtomicU32::new(0),
            teardowns: AtomicU32::new(0),
            live: Mutex::new(BTreeSet::new()),
            live_count,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Root handed out for every environment.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Sleep this long inside every provision call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue errors returned by the next provision calls, in order.
    pub fn fail_next(self, errors: impl IntoIterator<Item = ProvisionError>) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(errors);
        self
    }

    /// Provision calls made, including failed ones.
    pub fn provisions(&self) -> u32 {
        self.provisions.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> u32 {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// Environments provisioned and not yet torn down.
    pub fn live(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait until every provisioned environment has been torn down.
    pub async fn wait_idle(&self) {
        let mut rx = self.live_count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn record(&self, event: BackendEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[async_trait]
impl ProvisionBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    async fn provision(&self, spec: &ProvisioningSpec) -> ProvisionResult<Environment> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(err) = queued {
            return Err(err);
        }

        let id = format!("env-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        {
            let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            live.insert(id.clone());
            self.live_count.send_replace(live.len());
        }
        self.record(BackendEvent::Provisioned(id.clone()));
        Ok(Environment {
            id,
            builder: spec.builder,
            root: self.root.clone(),
            exec_prefix: Vec::new(),
            env: Default::default(),
        })
    }

    async fn teardown(&self, env: Environment) -> ProvisionResult<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        let removed = {
            let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            let removed = live.remove(&env.id);
            self.live_count.send_replace(live.len());
            removed
        };
        if !removed {
            return Err(ProvisionError::Teardown {
                id: env.id,
                reason: "environment is not live".to_string(),
            });
        }
        self.record(BackendEvent::TornDown(env.id));
        Ok(())
    }
}
