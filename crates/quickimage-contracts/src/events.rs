use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only JSONL log of generation lifecycle events. Every line carries
/// `type`, `run_id` and `ts`; payload keys are merged over them. Clones share
/// one lock, so lines from concurrent generations never interleave.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    run_id: String,
    append: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Shared {
                path: path.into(),
                run_id: run_id.into(),
                append: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Appends one event and returns it as written.
    pub fn emit(&self, event_type: &str, payload: EventPayload) -> io::Result<Value> {
        let mut event = self.envelope(event_type);
        event.extend(payload);
        let event = Value::Object(event);

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        self.append_line(&line)?;
        Ok(event)
    }

    fn envelope(&self, event_type: &str) -> EventPayload {
        let mut event = EventPayload::new();
        event.insert("type".into(), event_type.into());
        event.insert("run_id".into(), self.inner.run_id.as_str().into());
        event.insert(
            "ts".into(),
            Utc::now()
                .to_rfc3339_opts(SecondsFormat::Micros, false)
                .into(),
        );
        event
    }

    fn append_line(&self, line: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.inner.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _guard = self
            .inner
            .append
            .lock()
            .map_err(|_| io::Error::other("event log lock poisoned"))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?
            .write_all(line)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::{EventPayload, EventWriter};

    fn payload(value: Value) -> EventPayload {
        match value {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        }
    }

    fn read_events(writer: &EventWriter) -> anyhow::Result<Vec<Value>> {
        let content = std::fs::read_to_string(writer.path())?;
        Ok(content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<Vec<Value>, _>>()?)
    }

    #[test]
    fn generation_events_carry_run_id_and_timestamp() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(
            temp.path().join("logs").join("events.jsonl"),
            "65f0c0ffee0000000000beef",
        );

        let started = writer.emit(
            "generation_started",
            payload(json!({"id": "a1", "model": "dall-e-3", "prompt": "a red bicycle"})),
        )?;
        writer.emit(
            "generation_failed",
            payload(json!({"id": "a1", "kind": "missing_credentials", "message": "Error: OPENAI_API_KEY not set"})),
        )?;

        let events = read_events(&writer)?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], started);
        assert_eq!(events[0]["run_id"], "65f0c0ffee0000000000beef");
        assert_eq!(events[0]["model"], "dall-e-3");
        assert_eq!(events[1]["type"], "generation_failed");
        assert_eq!(events[1]["kind"], "missing_credentials");
        for event in &events {
            DateTime::parse_from_rfc3339(event["ts"].as_str().unwrap_or(""))?;
        }
        Ok(())
    }

    #[test]
    fn payload_keys_win_over_envelope() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-1");
        let emitted = writer.emit(
            "video_job_finished",
            payload(json!({"run_id": "replayed", "state": "complete"})),
        )?;
        assert_eq!(emitted["run_id"], "replayed");
        assert_eq!(emitted["type"], "video_job_finished");
        Ok(())
    }

    #[test]
    fn concurrent_clones_write_whole_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-1");

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let writer = writer.clone();
                thread::spawn(move || -> std::io::Result<()> {
                    for attempt in 0..25 {
                        writer.emit(
                            "artifact_saved",
                            payload(json!({"id": format!("w{worker}-{attempt}"), "bytes": 1024})),
                        )?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
        }

        let events = read_events(&writer)?;
        assert_eq!(events.len(), 200);
        assert!(events.iter().all(|event| event["type"] == "artifact_saved"));
        Ok(())
    }
}
