use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use photoshift_contracts::errors::ProviderError;
use photoshift_contracts::jobs::{ImageRef, JobHandle};
use serde_json::Map;

use crate::poller::Clock;
use crate::provider::{
    ProviderSubmission, ProviderSubmitRequest, RemoteStatus, SubmitOutcome,
    TransformationProvider,
};
use crate::storage::{ImageBytes, ImageStore};

const GATE_TIMEOUT: Duration = Duration::from_secs(5);

/// One-shot rendezvous between a test and a test double running on another
/// thread. The first `pass` parks the caller until the test calls `release`;
/// later passes go straight through.
pub(crate) struct Gate {
    armed: AtomicBool,
    entered: (Mutex<Sender<()>>, Mutex<Receiver<()>>),
    released: (Mutex<Sender<()>>, Mutex<Receiver<()>>),
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        let (entered_tx, entered_rx) = channel();
        let (released_tx, released_rx) = channel();
        Arc::new(Self {
            armed: AtomicBool::new(true),
            entered: (Mutex::new(entered_tx), Mutex::new(entered_rx)),
            released: (Mutex::new(released_tx), Mutex::new(released_rx)),
        })
    }

    pub(crate) fn pass(&self) {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.entered.0.lock().unwrap().send(());
        let _ = self.released.1.lock().unwrap().recv_timeout(GATE_TIMEOUT);
    }

    /// Blocks until a double reaches the gate.
    pub(crate) fn wait_entered(&self) {
        self.entered
            .1
            .lock()
            .unwrap()
            .recv_timeout(GATE_TIMEOUT)
            .expect("gate never entered");
    }

    pub(crate) fn release(&self) {
        let _ = self.released.0.lock().unwrap().send(());
    }
}

/// Provider that replays queued responses. Once a queue runs dry, submits
/// complete immediately and status queries report "processing".
pub(crate) struct ScriptedProvider {
    submits: Mutex<VecDeque<Result<SubmitOutcome, ProviderError>>>,
    statuses: Mutex<VecDeque<Result<RemoteStatus, ProviderError>>>,
    submit_calls: AtomicU32,
    status_calls: AtomicU32,
    submit_gate: Option<Arc<Gate>>,
    status_gate: Option<(u32, Arc<Gate>)>,
}

impl ScriptedProvider {
    pub(crate) fn new() -> Self {
        Self {
            submits: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            submit_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            submit_gate: None,
            status_gate: None,
        }
    }

    /// Parks the first submit at `gate` before it answers.
    pub(crate) fn gate_submit(mut self, gate: Arc<Gate>) -> Self {
        self.submit_gate = Some(gate);
        self
    }

    /// Parks the `call`-th status query (1-based) at `gate` before it answers.
    pub(crate) fn gate_status(mut self, call: u32, gate: Arc<Gate>) -> Self {
        self.status_gate = Some((call, gate));
        self
    }

    pub(crate) fn submits(self, rows: Vec<Result<SubmitOutcome, ProviderError>>) -> Self {
        *self.submits.lock().unwrap() = rows.into();
        self
    }

    pub(crate) fn statuses(self, rows: Vec<Result<RemoteStatus, ProviderError>>) -> Self {
        *self.statuses.lock().unwrap() = rows.into();
        self
    }

    pub(crate) fn always_processing(self) -> Self {
        self.statuses.lock().unwrap().clear();
        self
    }

    pub(crate) fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

impl TransformationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn submit(&self, request: &ProviderSubmitRequest) -> Result<ProviderSubmission, ProviderError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.submit_gate {
            gate.pass();
        }
        let next = self.submits.lock().unwrap().pop_front();
        let outcome = match next {
            Some(row) => row?,
            None => SubmitOutcome::Immediate(ImageRef::new(format!(
                "scripted://{}.png",
                request.job_id
            ))),
        };
        Ok(ProviderSubmission {
            outcome,
            provider_request: Map::new(),
            provider_response: Map::new(),
        })
    }

    fn query_status(&self, _handle: &JobHandle) -> Result<RemoteStatus, ProviderError> {
        let call = self.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((_, gate)) = self.status_gate.as_ref().filter(|(at, _)| *at == call) {
            gate.pass();
        }
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(RemoteStatus::Processing))
    }
}

/// Virtual clock: sleeping records the duration and advances `now` instantly.
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }
}

pub(crate) struct MemoryImageStore {
    names: HashSet<String>,
    load_gate: Option<Arc<Gate>>,
}

impl MemoryImageStore {
    pub(crate) fn with(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|name| name.to_string()).collect(),
            load_gate: None,
        }
    }

    /// Parks the first load at `gate`.
    pub(crate) fn gate_load(mut self, gate: Arc<Gate>) -> Self {
        self.load_gate = Some(gate);
        self
    }
}

impl ImageStore for MemoryImageStore {
    fn is_resolvable(&self, reference: &ImageRef) -> bool {
        self.names.contains(reference.as_str())
    }

    fn load(&self, reference: &ImageRef) -> Result<ImageBytes> {
        if let Some(gate) = &self.load_gate {
            gate.pass();
        }
        if !self.is_resolvable(reference) {
            bail!("no image named {reference}");
        }
        Ok(ImageBytes {
            bytes: reference.as_str().as_bytes().to_vec(),
            mime_type: Some("image/png".to_string()),
        })
    }
}
