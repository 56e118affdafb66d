use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    AccessMode, CapabilityHandle, ChangeSignature, HandleKind, HandleRecord, PermissionState,
};
use crate::error::{Result, SyncError};
use crate::lock;

#[derive(Debug)]
struct MemoryFile {
    content: String,
    modified_at: DateTime<Utc>,
    read: PermissionState,
    write: PermissionState,
    scripted_answers: VecDeque<PermissionState>,
    default_answer: PermissionState,
    valid: bool,
    fail_io: bool,
    write_delay: Option<Duration>,
    writes: usize,
    prompts: usize,
}

/// In-memory file handle with a logical clock.
///
/// Every write (local or simulated external) advances `modified_at` by one
/// second so signatures always move forward.
#[derive(Debug)]
pub struct MemoryHandle {
    name: String,
    file: Mutex<MemoryFile>,
}

impl MemoryHandle {
    /// Read granted, write unrequested, prompts answer "granted".
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: Mutex::new(MemoryFile {
                content: content.into(),
                modified_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
                read: PermissionState::Granted,
                write: PermissionState::Prompt,
                scripted_answers: VecDeque::new(),
                default_answer: PermissionState::Granted,
                valid: true,
                fail_io: false,
                write_delay: None,
                writes: 0,
                prompts: 0,
            }),
        }
    }

    pub fn with_permissions(self, read: PermissionState, write: PermissionState) -> Self {
        {
            let mut file = lock(&self.file);
            file.read = read;
            file.write = write;
        }
        self
    }

    /// Answer every future prompt with `answer` unless a scripted answer is
    /// queued.
    pub fn answer_prompts_with(&self, answer: PermissionState) {
        lock(&self.file).default_answer = answer;
    }

    /// Queue a one-off prompt answer.
    pub fn queue_answer(&self, answer: PermissionState) {
        lock(&self.file).scripted_answers.push_back(answer);
    }

    /// Simulate another program rewriting the file.
    pub fn external_write(&self, content: impl Into<String>) {
        let mut file = lock(&self.file);
        file.content = content.into();
        file.modified_at += chrono::Duration::seconds(1);
    }

    pub fn revoke(&self, mode: AccessMode) {
        let mut file = lock(&self.file);
        match mode {
            AccessMode::Read => {
                file.read = PermissionState::Prompt;
                file.write = PermissionState::Prompt;
            }
            AccessMode::ReadWrite => file.write = PermissionState::Prompt,
        }
    }

    /// Simulate the entry being deleted.
    pub fn invalidate(&self) {
        lock(&self.file).valid = false;
    }

    /// Make content reads and writes fail with an i/o error.
    pub fn fail_io(&self, fail: bool) {
        lock(&self.file).fail_io = fail;
    }

    /// Make writes take `delay` before committing, to open an overlap window.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        lock(&self.file).write_delay = delay;
    }

    pub fn content(&self) -> String {
        lock(&self.file).content.clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.file).writes
    }

    pub fn prompt_count(&self) -> usize {
        lock(&self.file).prompts
    }

    fn check(&self, file: &MemoryFile) -> Result<()> {
        if !file.valid {
            return Err(SyncError::invalid(&self.name, "entry was removed"));
        }
        if file.fail_io {
            return Err(SyncError::io(
                &self.name,
                std::io::Error::other("simulated i/o failure"),
            ));
        }
        Ok(())
    }

    fn permission(file: &MemoryFile, mode: AccessMode) -> PermissionState {
        match mode {
            AccessMode::Read if file.write == PermissionState::Granted => PermissionState::Granted,
            AccessMode::Read => file.read,
            AccessMode::ReadWrite => file.write,
        }
    }

    fn require(&self, file: &MemoryFile, mode: AccessMode) -> Result<()> {
        match Self::permission(file, mode) {
            PermissionState::Granted => Ok(()),
            PermissionState::Denied => Err(SyncError::PermissionDenied {
                mode,
                name: self.name.clone(),
            }),
            PermissionState::Prompt => Err(SyncError::PermissionUnresolved {
                mode,
                name: self.name.clone(),
            }),
        }
    }
}

#[async_trait]
impl CapabilityHandle for MemoryHandle {
    fn kind(&self) -> HandleKind {
        HandleKind::File
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn record(&self) -> HandleRecord {
        HandleRecord {
            kind: HandleKind::File,
            path: PathBuf::from(&self.name),
        }
    }

    async fn query_permission(&self, mode: AccessMode) -> Result<PermissionState> {
        let file = lock(&self.file);
        if !file.valid {
            return Err(SyncError::invalid(&self.name, "entry was removed"));
        }
        Ok(Self::permission(&file, mode))
    }

    async fn request_permission(&self, mode: AccessMode) -> Result<PermissionState> {
        let mut file = lock(&self.file);
        if !file.valid {
            return Err(SyncError::invalid(&self.name, "entry was removed"));
        }
        let current = Self::permission(&file, mode);
        if current == PermissionState::Granted {
            return Ok(current);
        }
        file.prompts += 1;
        let answer = file
            .scripted_answers
            .pop_front()
            .unwrap_or(file.default_answer);
        if answer != PermissionState::Prompt {
            match mode {
                AccessMode::Read => file.read = answer,
                AccessMode::ReadWrite => {
                    file.write = answer;
                    if answer == PermissionState::Granted {
                        file.read = answer;
                    }
                }
            }
        }
        Ok(answer)
    }

    async fn read_text(&self) -> Result<String> {
        let file = lock(&self.file);
        self.check(&file)?;
        self.require(&file, AccessMode::Read)?;
        Ok(file.content.clone())
    }

    async fn write_text(&self, content: &str) -> Result<()> {
        let delay = {
            let file = lock(&self.file);
            self.check(&file)?;
            self.require(&file, AccessMode::ReadWrite)?;
            file.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut file = lock(&self.file);
        self.check(&file)?;
        file.content = content.to_string();
        file.modified_at += chrono::Duration::seconds(1);
        file.writes += 1;
        Ok(())
    }

    async fn signature(&self) -> Result<ChangeSignature> {
        let file = lock(&self.file);
        // Metadata stays readable while content i/o fails.
        if !file.valid {
            return Err(SyncError::invalid(&self.name, "entry was removed"));
        }
        Ok(ChangeSignature {
            modified_at: file.modified_at,
            size_bytes: file.content.len() as u64,
        })
    }
}
