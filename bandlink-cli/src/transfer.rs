//! Transfer actor: owns the controller and runs its commands against the session and
//! file source.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bandlink_core::{
    Command, FileCommand, FileOffer, JobId, RouterError, TextRange, TransferConfig,
    TransferController, TransferError, FILE_TAG,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info};

use crate::files::FileSource;
use crate::session::Session;

/// Outcome callbacks for one transfer. Exactly one of `on_success` / `on_error` ends it.
pub trait TransferObserver: Send {
    fn on_progress(&mut self, progress: f64, status: &str);
    fn on_success(&mut self, message: &str, count: u64);
    fn on_error(&mut self, message: &str, count: u64);
}

/// Observer built from three closures.
pub struct FnObserver<P, S, E> {
    progress: P,
    success: S,
    error: E,
}

impl<P, S, E> FnObserver<P, S, E>
where
    P: FnMut(f64, &str) + Send,
    S: FnMut(&str, u64) + Send,
    E: FnMut(&str, u64) + Send,
{
    pub fn new(progress: P, success: S, error: E) -> Self {
        Self {
            progress,
            success,
            error,
        }
    }
}

impl<P, S, E> TransferObserver for FnObserver<P, S, E>
where
    P: FnMut(f64, &str) + Send,
    S: FnMut(&str, u64) + Send,
    E: FnMut(&str, u64) + Send,
{
    fn on_progress(&mut self, progress: f64, status: &str) {
        (self.progress)(progress, status)
    }

    fn on_success(&mut self, message: &str, count: u64) {
        (self.success)(message, count)
    }

    fn on_error(&mut self, message: &str, count: u64) {
        (self.error)(message, count)
    }
}

enum Event {
    SendFile(FileOffer, Box<dyn TransferObserver>),
    Cancel,
    Inbound(Map<String, Value>),
    ReadDone {
        job: JobId,
        index: u64,
        result: Result<String, String>,
    },
    SendFailed {
        job: JobId,
        message: FileCommand,
        reason: String,
    },
}

/// Handle to the transfer actor of one session.
#[derive(Clone)]
pub struct TransferHandle {
    tx: mpsc::UnboundedSender<Event>,
    busy: Arc<AtomicBool>,
}

impl TransferHandle {
    /// Claim the file tag on the session's channel and start the actor.
    pub fn spawn(
        session: Arc<Session>,
        files: Arc<dyn FileSource>,
        config: TransferConfig,
    ) -> Result<Self, RouterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = tx.clone();
        session.channel().register_handler(FILE_TAG, move |fields| {
            inbound
                .send(Event::Inbound(fields))
                .map_err(|_| anyhow::anyhow!("transfer actor stopped"))
        })?;

        let busy = Arc::new(AtomicBool::new(false));
        let actor = Actor {
            controller: TransferController::new(config),
            observer: None,
            session,
            files,
            tx: tx.clone(),
            busy: busy.clone(),
        };
        tokio::spawn(actor.run(rx));
        Ok(Self { tx, busy })
    }

    /// Start sending `offer`. While another transfer is running or queued, `observer.on_error`
    /// is called before this returns and the offer is rejected.
    pub fn send_file(
        &self,
        offer: FileOffer,
        observer: impl TransferObserver + 'static,
    ) -> Result<(), TransferError> {
        let mut observer: Box<dyn TransferObserver> = Box::new(observer);
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let err = TransferError::Busy;
            observer.on_error(&err.to_string(), 0);
            return Err(err);
        }
        match self.tx.send(Event::SendFile(offer, observer)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(event)) => {
                self.busy.store(false, Ordering::SeqCst);
                let err = TransferError::Stopped;
                if let Event::SendFile(_, mut observer) = event {
                    observer.on_error(&err.to_string(), 0);
                }
                Err(err)
            }
        }
    }

    /// Abort the running transfer, if any. No callbacks fire for it.
    pub fn cancel(&self) {
        let _ = self.tx.send(Event::Cancel);
    }

    /// Whether a transfer is running or accepted and waiting to start.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

struct Actor {
    controller: TransferController,
    observer: Option<Box<dyn TransferObserver>>,
    session: Arc<Session>,
    files: Arc<dyn FileSource>,
    tx: mpsc::UnboundedSender<Event>,
    busy: Arc<AtomicBool>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            let now = time::Instant::now().into_std();
            // The handle claims the flag for a queued offer, so only release it when a job
            // ends or an offer finishes without starting one.
            let may_release = self.controller.is_busy() || matches!(event, Event::SendFile(..));
            let commands = match event {
                Event::SendFile(offer, mut observer) => match self.controller.send_file(offer) {
                    Ok(commands) => {
                        self.observer = Some(observer);
                        commands
                    }
                    Err(e) => {
                        observer.on_error(&e.to_string(), 0);
                        Vec::new()
                    }
                },
                Event::Cancel => self.controller.cancel(),
                Event::Inbound(fields) => self.controller.on_message(&fields, now),
                Event::ReadDone { job, index, result } => {
                    self.controller.on_chunk_read(job, index, result, now)
                }
                Event::SendFailed {
                    job,
                    message,
                    reason,
                } => self.controller.on_send_failed(job, &message, &reason),
            };
            for command in commands {
                self.execute(command);
            }
            if !self.controller.is_busy() {
                self.observer = None;
                if may_release {
                    self.busy.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Send { job, message } => {
                let session = self.session.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.send(FILE_TAG, &message).await {
                        let _ = tx.send(Event::SendFailed {
                            job,
                            message,
                            reason: e.to_string(),
                        });
                    }
                });
            }
            Command::Read {
                job,
                index,
                path,
                range,
            } => {
                let files = self.files.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = read(files.as_ref(), &path, range).await;
                    let _ = tx.send(Event::ReadDone { job, index, result });
                });
            }
            Command::Progress { progress, status } => {
                if let Some(observer) = &mut self.observer {
                    observer.on_progress(progress, &status);
                }
            }
            Command::Succeeded { message, count } => {
                info!(count, "transfer succeeded");
                if let Some(mut observer) = self.observer.take() {
                    observer.on_success(&message, count);
                }
            }
            Command::Failed { message, count } => {
                info!(count, error = %message, "transfer failed");
                if let Some(mut observer) = self.observer.take() {
                    observer.on_error(&message, count);
                }
            }
        }
    }
}

async fn read(files: &dyn FileSource, path: &Path, range: TextRange) -> Result<String, String> {
    debug!(path = %path.display(), offset = range.offset, len = range.len, "reading chunk");
    files.read_text(path, range).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EnvelopeChannel;
    use crate::memory::MemoryChannel;
    use async_trait::async_trait;
    use bandlink_core::{HandshakeConfig, HandshakeMessage, HANDSHAKE_TAG};
    use serde_json::json;
    use std::io;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Text made of `len` repetitions of 'x'.
    struct Synthetic(u64);

    #[async_trait]
    impl FileSource for Synthetic {
        async fn read_text(&self, _path: &Path, range: TextRange) -> io::Result<String> {
            let end = (range.offset + range.len).min(self.0);
            Ok("x".repeat(end.saturating_sub(range.offset) as usize))
        }
    }

    struct Failing;

    #[async_trait]
    impl FileSource for Failing {
        async fn read_text(&self, _path: &Path, _range: TextRange) -> io::Result<String> {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Outcome {
        Progress(f64),
        Success(String),
        Error(String, u64),
    }

    fn recorder() -> (
        impl TransferObserver + 'static,
        Arc<Mutex<Vec<Outcome>>>,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (p, s, e) = (log.clone(), log.clone(), log.clone());
        let observer = FnObserver::new(
            move |progress, _status: &str| p.lock().unwrap().push(Outcome::Progress(progress)),
            move |message: &str, _count| s.lock().unwrap().push(Outcome::Success(message.into())),
            move |message: &str, count| {
                e.lock().unwrap().push(Outcome::Error(message.into(), count))
            },
        );
        (observer, log)
    }

    /// A host wired to a raw device end that the test drives by hand.
    struct Rig {
        handle: TransferHandle,
        device_out: mpsc::UnboundedReceiver<String>,
        device_in: mpsc::UnboundedSender<String>,
    }

    impl Rig {
        fn new(files: Arc<dyn FileSource>) -> Self {
            let raw = MemoryChannel::new();
            let (to_device, device_out) = mpsc::unbounded_channel();
            raw.route("device", to_device);
            let (device_in, inbound) = mpsc::unbounded_channel();
            let channel = Arc::new(EnvelopeChannel::new("device", raw));
            let session = Session::start(channel, HandshakeConfig::default(), inbound).unwrap();
            let handle = TransferHandle::spawn(session, files, TransferConfig::default()).unwrap();
            Self {
                handle,
                device_out,
                device_in,
            }
        }

        fn reply(&self, value: Value) {
            self.device_in.send(value.to_string()).unwrap();
        }

        /// Next file-tag message, answering handshakes along the way.
        async fn next_file(&mut self) -> Value {
            loop {
                let raw = self.device_out.recv().await.unwrap();
                let v: Value = serde_json::from_str(&raw).unwrap();
                if v["tag"] == HANDSHAKE_TAG {
                    let msg: HandshakeMessage = serde_json::from_value(v.clone()).unwrap();
                    if let Some(reply) = msg.reply() {
                        self.reply(json!({"tag": HANDSHAKE_TAG, "count": reply.count}));
                    }
                    continue;
                }
                return v;
            }
        }
    }

    fn offer(byte_size: u64, text_length: u64) -> FileOffer {
        FileOffer {
            filename: "a.txt".into(),
            path: PathBuf::from("/p/a.txt"),
            byte_size,
            text_length,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_transfer_reports_success() {
        let mut rig = Rig::new(Arc::new(Synthetic(50_000)));
        let (observer, log) = recorder();
        rig.handle.send_file(offer(102_400, 50_000), observer).unwrap();

        let start = rig.next_file().await;
        assert_eq!(start["stat"], "startTransfer");
        assert_eq!(start["total"], 5);
        assert!(rig.handle.is_busy());

        rig.reply(json!({"tag": "file", "type": "ready", "found": false}));
        for n in 0..=5u64 {
            let chunk = rig.next_file().await;
            assert_eq!(chunk["stat"], "d");
            assert_eq!(chunk["count"], n);
            rig.reply(json!({"tag": "file", "type": "next", "count": n + 1}));
        }
        rig.reply(json!({"tag": "file", "type": "success", "message": "ok", "count": 6}));
        time::sleep(std::time::Duration::from_millis(10)).await;

        let log = log.lock().unwrap();
        assert_eq!(log.last(), Some(&Outcome::Success("ok".into())));
        assert_eq!(log[log.len() - 2], Outcome::Progress(1.0));
        assert!(!rig.handle.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn second_send_while_busy_is_rejected() {
        let mut rig = Rig::new(Arc::new(Synthetic(50_000)));
        let (first, first_log) = recorder();
        let (second, second_log) = recorder();
        rig.handle.send_file(offer(102_400, 50_000), first).unwrap();
        rig.next_file().await;
        assert_eq!(
            rig.handle.send_file(offer(10, 10), second),
            Err(TransferError::Busy)
        );

        assert_eq!(
            *second_log.lock().unwrap(),
            vec![Outcome::Error(
                "a file transfer is already in progress".into(),
                0
            )]
        );
        assert_eq!(*first_log.lock().unwrap(), vec![Outcome::Progress(0.0)]);
        assert!(rig.handle.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_is_reported_before_the_job_starts() {
        let rig = Rig::new(Arc::new(Synthetic(50_000)));
        let (first, _first_log) = recorder();
        let (second, second_log) = recorder();
        rig.handle.send_file(offer(102_400, 50_000), first).unwrap();
        // The actor has not run yet; the queued offer already holds the slot.
        assert!(rig.handle.is_busy());
        assert_eq!(
            rig.handle.send_file(offer(10, 10), second),
            Err(TransferError::Busy)
        );
        assert_eq!(second_log.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_is_released_after_an_empty_file() {
        let rig = Rig::new(Arc::new(Synthetic(0)));
        let (first, first_log) = recorder();
        rig.handle.send_file(offer(0, 0), first).unwrap();
        time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(matches!(
            first_log.lock().unwrap().last(),
            Some(Outcome::Success(_))
        ));
        assert!(!rig.handle.is_busy());

        let (second, _second_log) = recorder();
        assert_eq!(rig.handle.send_file(offer(0, 0), second), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_ends_the_transfer() {
        let mut rig = Rig::new(Arc::new(Failing));
        let (observer, log) = recorder();
        rig.handle.send_file(offer(102_400, 50_000), observer).unwrap();
        rig.next_file().await;
        rig.reply(json!({"tag": "file", "type": "ready", "found": false}));
        time::sleep(std::time::Duration::from_millis(10)).await;

        let log = log.lock().unwrap();
        assert!(matches!(log.last(), Some(Outcome::Error(_, 0))));
        assert!(!rig.handle.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_sends_cancel_and_stays_silent() {
        let mut rig = Rig::new(Arc::new(Synthetic(50_000)));
        let (observer, log) = recorder();
        rig.handle.send_file(offer(102_400, 50_000), observer).unwrap();
        rig.next_file().await;
        rig.handle.cancel();

        assert_eq!(rig.next_file().await["stat"], "cancel");
        time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!rig.handle.is_busy());
        assert_eq!(*log.lock().unwrap(), vec![Outcome::Progress(0.0)]);

        // Late device messages are ignored once idle.
        rig.reply(json!({"tag": "file", "type": "next", "count": 1}));
        time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_handshake_fails_the_start() {
        let raw = MemoryChannel::new();
        let (to_device, _device_out) = mpsc::unbounded_channel();
        raw.route("device", to_device);
        let (_device_in, inbound) = mpsc::unbounded_channel();
        let channel = Arc::new(EnvelopeChannel::new("device", raw));
        let session = Session::start(channel, HandshakeConfig::default(), inbound).unwrap();
        let handle =
            TransferHandle::spawn(session, Arc::new(Synthetic(10)), TransferConfig::default())
                .unwrap();
        let (observer, log) = recorder();
        handle.send_file(offer(10, 10), observer).unwrap();
        time::sleep(std::time::Duration::from_millis(3500)).await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2, "{log:?}");
        assert!(
            matches!(&log[1], Outcome::Error(message, 0) if message.contains("timed out")),
            "{log:?}"
        );
        assert!(!handle.is_busy());
    }
}
