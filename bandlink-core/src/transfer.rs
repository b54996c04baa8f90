//! Peer-paced, resumable, single-flight file transfer.
//!
//! The controller never decides on its own which chunk goes next: every chunk is sent in
//! answer to a device message (`ready`, `next`, `error`) naming the index it wants. The host
//! runs the returned [`Command`]s and reports their completion back (`on_chunk_read`,
//! `on_send_failed`).

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::format::format_bytes;
use crate::protocol::{DeviceMessage, FileCommand, CHUNK_BYTES, STORAGE_QUOTA};

const MIN_CHUNK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Byte size that decides the chunk count.
    pub chunk_bytes: u64,
    /// Device usage above this aborts the transfer.
    pub storage_quota: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: CHUNK_BYTES,
            storage_quota: STORAGE_QUOTA,
        }
    }
}

/// A file the caller wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    /// Name shown on the device.
    pub filename: String,
    pub path: PathBuf,
    /// Size on disk; decides the chunk count.
    pub byte_size: u64,
    /// Length of the decoded text in chars; decides how much text each chunk carries.
    pub text_length: u64,
}

/// Range of decoded text, in chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRange {
    pub offset: u64,
    pub len: u64,
}

/// Chunk geometry fixed at job start. Chunks are indexed `0..=total_chunks`; the last index
/// carries whatever text the floor division left over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_chunks: u64,
    pub byte_chunk_size: u64,
    pub text_chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(byte_size: u64, text_length: u64, byte_chunk_size: u64) -> Self {
        let byte_chunk_size = byte_chunk_size.max(1);
        let total_chunks = byte_size.div_ceil(byte_chunk_size);
        let text_chunk_size = if total_chunks == 0 {
            0
        } else {
            text_length / total_chunks
        };
        Self {
            total_chunks,
            byte_chunk_size,
            text_chunk_size,
        }
    }

    pub fn range(&self, index: u64) -> TextRange {
        TextRange {
            offset: index.saturating_mul(self.text_chunk_size),
            len: self.text_chunk_size,
        }
    }

    /// Chunk to resume from, given the text length the device already stored.
    /// An index past the end means the device state is stale, so start over.
    pub fn resume_index(&self, stored_length: u64) -> u64 {
        let index = stored_length / self.byte_chunk_size;
        if index > self.total_chunks {
            0
        } else {
            index
        }
    }

    pub fn progress(&self, index: u64) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        index as f64 / self.total_chunks as f64
    }
}

/// Identifies one job so completions from an earlier job are not mistaken for current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

/// Work for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Send through the gated session on the file tag.
    Send { job: JobId, message: FileCommand },
    /// Read a text range and report it with `on_chunk_read`.
    Read {
        job: JobId,
        index: u64,
        path: PathBuf,
        range: TextRange,
    },
    Progress { progress: f64, status: String },
    Succeeded { message: String, count: u64 },
    Failed { message: String, count: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("a file transfer is already in progress")]
    Busy,
    #[error("file transfer service stopped")]
    Stopped,
}

#[derive(Debug)]
enum ReadAhead {
    Empty,
    Pending(u64),
    Ready(u64, String),
}

#[derive(Debug)]
struct Job {
    id: JobId,
    path: PathBuf,
    plan: ChunkPlan,
    read_ahead: ReadAhead,
    /// Chunk waiting for its read to finish, with its resend flag.
    waiting: Option<(u64, bool)>,
    last_chunk_at: Option<Instant>,
}

/// Single-flight transfer state machine.
#[derive(Debug)]
pub struct TransferController {
    config: TransferConfig,
    job: Option<Job>,
    next_job: u64,
}

impl TransferController {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            job: None,
            next_job: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.job.is_some()
    }

    pub fn plan(&self) -> Option<ChunkPlan> {
        self.job.as_ref().map(|j| j.plan)
    }

    /// Start a transfer. Fails without touching the running job if one is busy.
    pub fn send_file(&mut self, offer: FileOffer) -> Result<Vec<Command>, TransferError> {
        if self.job.is_some() {
            return Err(TransferError::Busy);
        }
        let plan = ChunkPlan::new(offer.byte_size, offer.text_length, self.config.chunk_bytes);
        if plan.total_chunks == 0 {
            return Ok(vec![Command::Succeeded {
                message: "file is empty, nothing to send".into(),
                count: 0,
            }]);
        }

        let id = JobId(self.next_job);
        self.next_job = self.next_job.wrapping_add(1);
        info!(
            filename = %offer.filename,
            total = plan.total_chunks,
            text_chunk = plan.text_chunk_size,
            "starting transfer"
        );
        self.job = Some(Job {
            id,
            path: offer.path.clone(),
            plan,
            read_ahead: ReadAhead::Pending(0),
            waiting: None,
            last_chunk_at: None,
        });
        Ok(vec![
            Command::Progress {
                progress: 0.0,
                status: "preparing to send...".into(),
            },
            Command::Read {
                job: id,
                index: 0,
                path: offer.path,
                range: plan.range(0),
            },
            Command::Send {
                job: id,
                message: FileCommand::StartTransfer {
                    filename: offer.filename,
                    total: plan.total_chunks,
                    chunk_size: plan.byte_chunk_size,
                },
            },
        ])
    }

    /// Drop the job and tell the device. No outcome is reported locally.
    pub fn cancel(&mut self) -> Vec<Command> {
        match self.job.take() {
            Some(job) => {
                info!("transfer cancelled locally");
                vec![Command::Send {
                    job: job.id,
                    message: FileCommand::Cancel,
                }]
            }
            None => vec![],
        }
    }

    /// Handle the fields of one envelope received on the file tag.
    pub fn on_message(&mut self, fields: &Map<String, Value>, now: Instant) -> Vec<Command> {
        if self.job.is_none() {
            return vec![];
        }
        let msg = match DeviceMessage::parse(fields) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(?fields, "ignoring unknown transfer message");
                return vec![];
            }
            Err(e) => {
                warn!(error = %e, "bad transfer message from peer");
                self.job = None;
                return vec![Command::Failed {
                    message: format!("received incompatible message from peer: {e}"),
                    count: 0,
                }];
            }
        };
        self.on_device_message(msg, now)
    }

    pub fn on_device_message(&mut self, msg: DeviceMessage, now: Instant) -> Vec<Command> {
        let Some(plan) = self.plan() else {
            return vec![];
        };
        match msg {
            DeviceMessage::Ready {
                found,
                usage,
                length,
            } => {
                if usage > self.config.storage_quota {
                    self.job = None;
                    return vec![Command::Failed {
                        message: "storage insufficient".into(),
                        count: 0,
                    }];
                }
                match length {
                    Some(stored) if found && stored > 0 => {
                        let index = plan.resume_index(stored as u64);
                        debug!(stored, index, "resuming transfer");
                        self.send_next_chunk(index, true, now)
                    }
                    _ => self.send_next_chunk(0, false, now),
                }
            }
            DeviceMessage::Error { count, message } => {
                debug!(count, %message, "peer asked for a chunk again");
                self.send_next_chunk(count, false, now)
            }
            DeviceMessage::Next { count, .. } => self.send_next_chunk(count, false, now),
            DeviceMessage::Success { message, count } => {
                info!(count, "transfer complete");
                self.job = None;
                vec![
                    Command::Progress {
                        progress: 1.0,
                        status: "transfer complete".into(),
                    },
                    Command::Succeeded { message, count },
                ]
            }
            DeviceMessage::Cancel => {
                info!("transfer cancelled by peer");
                self.job = None;
                vec![Command::Succeeded {
                    message: "transfer cancelled".into(),
                    count: 0,
                }]
            }
        }
    }

    /// Send chunk `index` once its text is available.
    pub fn send_next_chunk(&mut self, index: u64, resend: bool, now: Instant) -> Vec<Command> {
        let Some(job) = &mut self.job else {
            return vec![];
        };
        if index > job.plan.total_chunks {
            debug!(index, "all chunks sent, waiting for success");
            return vec![];
        }
        match std::mem::replace(&mut job.read_ahead, ReadAhead::Empty) {
            ReadAhead::Ready(buffered, text) if buffered == index => {
                self.emit_chunk(index, text, resend, now)
            }
            ReadAhead::Pending(pending) if pending == index => {
                job.read_ahead = ReadAhead::Pending(index);
                job.waiting = Some((index, resend));
                vec![]
            }
            _ => {
                job.read_ahead = ReadAhead::Pending(index);
                job.waiting = Some((index, resend));
                vec![Command::Read {
                    job: job.id,
                    index,
                    path: job.path.clone(),
                    range: job.plan.range(index),
                }]
            }
        }
    }

    /// Completion of a `Command::Read`.
    pub fn on_chunk_read(
        &mut self,
        job_id: JobId,
        index: u64,
        result: Result<String, String>,
        now: Instant,
    ) -> Vec<Command> {
        let Some(job) = &mut self.job else {
            return vec![];
        };
        if job.id != job_id || !matches!(job.read_ahead, ReadAhead::Pending(p) if p == index) {
            debug!(index, "discarding stale read");
            return vec![];
        }
        let text = match result {
            Ok(text) => text,
            Err(e) => {
                self.job = None;
                return vec![Command::Failed {
                    message: format!("failed to read chunk #{index}: {e}"),
                    count: index,
                }];
            }
        };
        match job.waiting.take() {
            Some((waiting, resend)) if waiting == index => {
                job.read_ahead = ReadAhead::Empty;
                self.emit_chunk(index, text, resend, now)
            }
            other => {
                job.waiting = other;
                job.read_ahead = ReadAhead::Ready(index, text);
                vec![]
            }
        }
    }

    /// A `Command::Send` could not be dispatched.
    pub fn on_send_failed(
        &mut self,
        job_id: JobId,
        message: &FileCommand,
        reason: &str,
    ) -> Vec<Command> {
        let (text, count) = match message {
            FileCommand::Cancel => {
                warn!(reason, "failed to send cancel message");
                return vec![];
            }
            FileCommand::StartTransfer { .. } => {
                (format!("failed to send start command: {reason}"), 0)
            }
            FileCommand::Data { count, .. } => {
                (format!("failed to send chunk #{count}: {reason}"), *count)
            }
        };
        match &self.job {
            Some(job) if job.id == job_id => {
                self.job = None;
                vec![Command::Failed {
                    message: text,
                    count,
                }]
            }
            _ => vec![],
        }
    }

    fn emit_chunk(&mut self, index: u64, text: String, resend: bool, now: Instant) -> Vec<Command> {
        let Some(job) = &mut self.job else {
            return vec![];
        };
        let plan = job.plan;
        let mut out = Vec::with_capacity(3);

        let status = match job.last_chunk_at {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).max(MIN_CHUNK_INTERVAL);
                let secs = elapsed.as_secs_f64();
                let speed = plan.byte_chunk_size as f64 / secs;
                let remaining = plan.total_chunks.saturating_sub(index) as f64 * secs;
                format!(" {}/s, {}s", format_bytes(speed, 2), remaining.round())
            }
            None => " --".to_string(),
        };
        out.push(Command::Progress {
            progress: plan.progress(index),
            status,
        });
        job.last_chunk_at = Some(now);

        if index < plan.total_chunks {
            let next = index + 1;
            job.read_ahead = ReadAhead::Pending(next);
            out.push(Command::Read {
                job: job.id,
                index: next,
                path: job.path.clone(),
                range: plan.range(next),
            });
        }

        out.push(Command::Send {
            job: job.id,
            message: FileCommand::Data {
                count: index,
                data: text,
                set_count: resend.then_some(index),
            },
        });
        out
    }
}

impl Default for TransferController {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}
