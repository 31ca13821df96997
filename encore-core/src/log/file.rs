//! JSON-lines event log
//!
//! One event per line, appended in the order batches are logged. The whole
//! file is read back on open and indexed in memory; queries never touch disk.

use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::event::ReplayEvent;
use super::memory::MemoryLog;
use super::state::{HookBinding, HookTrigger, RunState, Settlement, StepState};
use super::EventLog;
use crate::error::{EncoreError, Result};

/// Event log persisted to a JSON-lines file
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    file: Mutex<File>,
    index: MemoryLog,
}

impl FileLog {
    /// Open (or create) the log at `path`, loading any events already in it
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let events = if path.exists() {
            Self::read_events(&path)?
        } else {
            Vec::new()
        };
        tracing::debug!(path = %path.display(), events = events.len(), "Opened event log");

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            index: MemoryLog::with_events(events),
        })
    }

    /// Read every event stored at `path`
    pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<ReplayEvent>> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();

        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: ReplayEvent = serde_json::from_str(&line).map_err(|e| {
                EncoreError::Storage(format!(
                    "{}:{}: invalid event: {}",
                    path.display(),
                    number + 1,
                    e
                ))
            })?;
            events.push(event);
        }

        Ok(events)
    }

    /// Location of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventLog for FileLog {
    async fn log(&self, events: Vec<ReplayEvent>) -> Result<()> {
        // Held across the index insert so file order and index order agree
        let mut file = self.file.lock().await;

        let mut writer = BufWriter::new(&mut *file);
        for event in &events {
            serde_json::to_writer(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);

        self.index.insert(events).await;
        Ok(())
    }

    async fn run_state(&self, run_id: &str) -> Result<Option<RunState>> {
        self.index.run_state(run_id).await
    }

    async fn step_state(&self, run_id: &str, step: u32) -> Result<Option<StepState>> {
        self.index.step_state(run_id, step).await
    }

    async fn is_hook_bound(&self, token: &str, run_id: &str) -> Result<bool> {
        self.index.is_hook_bound(token, run_id).await
    }

    async fn hook_bindings(&self, token: &str) -> Result<Vec<HookBinding>> {
        self.index.hook_bindings(token).await
    }

    async fn hook_triggers(&self, token: &str) -> Result<Vec<HookTrigger>> {
        self.index.hook_triggers(token).await
    }

    async fn pending_runs(&self) -> Result<Vec<RunState>> {
        self.index.pending_runs().await
    }

    async fn pending_steps(&self, run_id: &str) -> Result<Vec<StepState>> {
        self.index.pending_steps(run_id).await
    }

    async fn settlements(&self, run_id: &str) -> Result<Vec<Settlement>> {
        self.index.settlements(run_id).await
    }

    async fn events(&self) -> Result<Vec<ReplayEvent>> {
        self.index.events().await
    }
}
