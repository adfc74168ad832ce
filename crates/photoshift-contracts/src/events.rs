use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Session journal: one compact JSON object per line.
///
/// Every line starts with `type`, `session_id` and `ts`; the caller payload is
/// merged over them. The file is opened on first use and kept open. Clones
/// share the handle, and a line is always written whole.
#[derive(Debug, Clone)]
pub struct EventWriter {
    journal: Arc<Journal>,
}

#[derive(Debug)]
struct Journal {
    path: PathBuf,
    session_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            journal: Arc::new(Journal {
                path: path.into(),
                session_id: session_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.journal.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let event = self.envelope(event_type, payload);
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = self
            .journal
            .file
            .lock()
            .map_err(|_| anyhow!("event journal lock poisoned"))?;
        if file.is_none() {
            *file = Some(self.open()?);
        }
        if let Some(file) = file.as_mut() {
            file.write_all(&line).with_context(|| {
                format!("failed appending to {}", self.journal.path.display())
            })?;
        }
        Ok(Value::Object(event))
    }

    fn envelope(&self, event_type: &str, payload: EventPayload) -> EventPayload {
        let mut event = EventPayload::new();
        event.insert("type".to_string(), Value::from(event_type));
        event.insert(
            "session_id".to_string(),
            Value::from(self.journal.session_id.as_str()),
        );
        event.insert(
            "ts".to_string(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        event.extend(payload);
        event
    }

    fn open(&self) -> anyhow::Result<File> {
        let path = &self.journal.path;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event journal {}", path.display()))
    }
}

/// Every event in a journal, in write order. Blank lines are skipped;
/// a malformed line is an error.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<EventPayload>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open event journal {}", path.display()))?;
    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line)
            .with_context(|| format!("{} line {}", path.display(), index + 1))?
        {
            Value::Object(event) => events.push(event),
            other => anyhow::bail!(
                "{} line {}: expected an object, got {other}",
                path.display(),
                index + 1
            ),
        }
    }
    Ok(events)
}

pub fn read_event_types(path: &Path) -> anyhow::Result<Vec<String>> {
    Ok(read_events(path)?
        .iter()
        .filter_map(|event| event.get("type").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}
