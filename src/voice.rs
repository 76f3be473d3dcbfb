//! Background voice command listener.
//!
//! One worker thread captures short audio windows, transcribes them and pushes
//! recognized intents into a bounded single-producer/single-consumer queue.
//! The main loop only ever reads from that queue; nothing else is shared
//! across the thread boundary besides the stop flag and a status indicator.

use crate::catalog::Catalog;
use crate::config::VoiceConfig;
use crate::constants::STOP_POLL_INTERVAL_MS;
use crate::{Error, Result};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Navigation requested by voice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavAction {
    Menu,
    Logout,
}

/// A decoded voice command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceIntent {
    /// Catalog key of the requested car
    CarSelect(String),
    Navigate(NavAction),
}

/// Mono PCM audio window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioClip {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Microphone capability
pub trait AudioSource: Send {
    /// Wait up to `timeout` for speech and record at most `phrase_limit`.
    /// `Ok(None)` means nobody spoke.
    fn capture(&mut self, timeout: Duration, phrase_limit: Duration) -> Result<Option<AudioClip>>;
}

/// Transcription failure, split by how the listener backs off
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionError {
    /// The speech service rejected or could not serve the request
    #[error("speech service error: {0}")]
    Service(String),

    #[error("transcription error: {0}")]
    Other(String),
}

/// Speech-to-text capability
pub trait Transcriber: Send {
    /// `Ok(None)` when the audio was not intelligible
    fn transcribe(&mut self, clip: &AudioClip) -> std::result::Result<Option<String>, TranscriptionError>;
}

/// Listener status visible from the main thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceStatus {
    Stopped,
    Listening,
    BackingOff,
    /// The worker missed the join timeout or panicked
    Unavailable,
}

impl VoiceStatus {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Listening => 1,
            Self::BackingOff => 2,
            Self::Unavailable => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Listening,
            2 => Self::BackingOff,
            3 => Self::Unavailable,
            _ => Self::Stopped,
        }
    }
}

/// Maps transcribed text to intents by keyword substring.
///
/// Car keyword sets are checked first in catalog order, then menu, then logout.
#[derive(Debug, Clone, Default)]
pub struct KeywordMatcher {
    cars: Vec<(String, Vec<String>)>,
    menu: Vec<String>,
    logout: Vec<String>,
}

fn lowered(words: &[String]) -> Vec<String> {
    words
        .iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

impl KeywordMatcher {
    #[must_use]
    pub fn new(cars: Vec<(String, Vec<String>)>, menu: &[String], logout: &[String]) -> Self {
        Self {
            cars: cars
                .into_iter()
                .map(|(key, words)| (key, lowered(&words)))
                .collect(),
            menu: lowered(menu),
            logout: lowered(logout),
        }
    }

    #[must_use]
    pub fn from_catalog(catalog: &Catalog, config: &VoiceConfig) -> Self {
        let cars = catalog
            .iter()
            .map(|car| (car.key.clone(), car.keywords.clone()))
            .collect();
        Self::new(cars, &config.menu_keywords, &config.logout_keywords)
    }

    #[must_use]
    pub fn match_text(&self, text: &str) -> Option<VoiceIntent> {
        let text = text.to_lowercase();
        let hit = |words: &[String]| words.iter().any(|w| text.contains(w.as_str()));

        if let Some((key, _)) = self.cars.iter().find(|(_, words)| hit(words)) {
            return Some(VoiceIntent::CarSelect(key.clone()));
        }
        if hit(&self.menu) {
            return Some(VoiceIntent::Navigate(NavAction::Menu));
        }
        if hit(&self.logout) {
            return Some(VoiceIntent::Navigate(NavAction::Logout));
        }
        None
    }
}

/// Timing of the listen loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceTiming {
    pub listen_timeout: Duration,
    pub phrase_limit: Duration,
    pub max_consecutive_errors: u32,
    pub service_backoff: Duration,
    pub error_backoff: Duration,
    pub retry_pause: Duration,
    pub join_timeout: Duration,
}

impl From<&VoiceConfig> for VoiceTiming {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            listen_timeout: config.listen_timeout(),
            phrase_limit: config.phrase_time_limit(),
            max_consecutive_errors: config.max_consecutive_errors.max(1),
            service_backoff: Duration::from_millis(config.service_backoff_ms),
            error_backoff: Duration::from_millis(config.error_backoff_ms),
            retry_pause: Duration::from_millis(config.retry_pause_ms),
            join_timeout: config.join_timeout(),
        }
    }
}

/// Anything the session can pull voice intents from
pub trait IntentSource {
    /// Next queued intent, without blocking
    fn next_intent(&mut self) -> Option<VoiceIntent>;
}

impl IntentSource for VecDeque<VoiceIntent> {
    fn next_intent(&mut self) -> Option<VoiceIntent> {
        self.pop_front()
    }
}

type Devices = (Box<dyn AudioSource>, Box<dyn Transcriber>);

struct Worker {
    handle: JoinHandle<Devices>,
    stop: Arc<AtomicBool>,
}

/// Sleep in short slices so a stop request is noticed promptly.
/// Returns `false` if stopped.
fn interruptible_sleep(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    let slice = Duration::from_millis(STOP_POLL_INTERVAL_MS);
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(slice.min(deadline - now));
    }
    false
}

enum FailureKind {
    Service,
    Other,
}

struct Listener {
    devices: Devices,
    matcher: KeywordMatcher,
    timing: VoiceTiming,
    sender: SyncSender<VoiceIntent>,
    stop: Arc<AtomicBool>,
    status: Arc<AtomicU8>,
    consecutive_errors: u32,
}

impl Listener {
    /// An abandoned worker must not overwrite `Unavailable`
    fn set_status(&self, status: VoiceStatus) {
        let unavailable = VoiceStatus::Unavailable.to_u8();
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != unavailable).then_some(status.to_u8())
            });
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(mut self) -> Devices {
        info!("Voice listener started");
        while !self.stopped() {
            self.set_status(VoiceStatus::Listening);
            let clip = match self.devices.0.capture(self.timing.listen_timeout, self.timing.phrase_limit) {
                Ok(Some(clip)) => clip,
                Ok(None) => continue,
                Err(e) => {
                    self.on_failure(FailureKind::Other, &e.to_string());
                    continue;
                }
            };
            if self.stopped() {
                debug!("Dropping captured audio, listener stopping");
                break;
            }

            match self.devices.1.transcribe(&clip) {
                Ok(Some(text)) => {
                    self.consecutive_errors = 0;
                    debug!("Heard: {text}");
                    if !self.dispatch(&text) {
                        break;
                    }
                }
                Ok(None) => debug!("Unintelligible audio discarded"),
                Err(TranscriptionError::Service(msg)) => self.on_failure(FailureKind::Service, &msg),
                Err(TranscriptionError::Other(msg)) => self.on_failure(FailureKind::Other, &msg),
            }
        }
        self.set_status(VoiceStatus::Stopped);
        info!("Voice listener stopped");
        self.devices
    }

    /// Queue the intent for `text`; `false` once the receiver is gone
    fn dispatch(&self, text: &str) -> bool {
        let Some(intent) = self.matcher.match_text(text) else {
            debug!("No command in '{text}'");
            return true;
        };
        match self.sender.try_send(intent) {
            Ok(()) => true,
            Err(TrySendError::Full(intent)) => {
                warn!("Voice queue full, dropping {intent:?}");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn on_failure(&mut self, kind: FailureKind, message: &str) {
        self.consecutive_errors += 1;
        warn!(
            "Voice error {}/{}: {}",
            self.consecutive_errors, self.timing.max_consecutive_errors, message
        );
        let pause = if self.consecutive_errors >= self.timing.max_consecutive_errors {
            self.consecutive_errors = 0;
            self.set_status(VoiceStatus::BackingOff);
            match kind {
                FailureKind::Service => self.timing.service_backoff,
                FailureKind::Other => self.timing.error_backoff,
            }
        } else {
            match kind {
                FailureKind::Service => Duration::ZERO,
                FailureKind::Other => self.timing.retry_pause,
            }
        };
        interruptible_sleep(pause, &self.stop);
    }
}

/// Start/stop-able voice listener with a bounded intent queue
pub struct VoiceCommandChannel {
    devices: Option<Devices>,
    matcher: KeywordMatcher,
    timing: VoiceTiming,
    capacity: usize,
    worker: Option<Worker>,
    /// Worker that missed the join timeout; still owns the devices
    abandoned: Option<Worker>,
    receiver: Option<Receiver<VoiceIntent>>,
    status: Arc<AtomicU8>,
}

impl VoiceCommandChannel {
    pub fn new(
        audio: Box<dyn AudioSource>,
        transcriber: Box<dyn Transcriber>,
        matcher: KeywordMatcher,
        timing: VoiceTiming,
        capacity: usize,
    ) -> Self {
        Self {
            devices: Some((audio, transcriber)),
            matcher,
            timing,
            capacity: capacity.max(1),
            worker: None,
            abandoned: None,
            receiver: None,
            status: Arc::new(AtomicU8::new(VoiceStatus::Stopped.to_u8())),
        }
    }

    #[must_use]
    pub fn status(&self) -> VoiceStatus {
        VoiceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Spawn the listener thread. Starting a running channel is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Voice` if an earlier abandoned worker still holds the devices,
    /// the worker panicked, or the thread cannot be spawned.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.reclaim_abandoned()?;
        let devices = self
            .devices
            .take()
            .ok_or_else(|| Error::Voice("Audio devices unavailable".to_string()))?;

        let (sender, receiver) = mpsc::sync_channel(self.capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let listener = Listener {
            devices,
            matcher: self.matcher.clone(),
            timing: self.timing,
            sender,
            stop: Arc::clone(&stop),
            status: Arc::clone(&self.status),
            consecutive_errors: 0,
        };
        self.status.store(VoiceStatus::Listening.to_u8(), Ordering::Release);
        let handle = thread::Builder::new()
            .name("voice-listener".to_string())
            .spawn(move || listener.run())
            .map_err(|e| {
                self.status.store(VoiceStatus::Unavailable.to_u8(), Ordering::Release);
                Error::Voice(format!("Failed to spawn listener: {e}"))
            })?;

        self.worker = Some(Worker { handle, stop });
        self.receiver = Some(receiver);
        Ok(())
    }

    /// Signal the worker and wait at most the join timeout. Queued intents are
    /// discarded. A worker that does not finish in time is abandoned.
    pub fn stop(&mut self) {
        self.receiver = None;
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);

        let deadline = Instant::now() + self.timing.join_timeout;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(STOP_POLL_INTERVAL_MS).min(self.timing.join_timeout));
        }
        if !worker.handle.is_finished() {
            warn!(
                "Voice listener did not stop within {:?}; abandoning it",
                self.timing.join_timeout
            );
            self.status.store(VoiceStatus::Unavailable.to_u8(), Ordering::Release);
            self.abandoned = Some(worker);
            return;
        }
        self.join(worker);
    }

    /// Take the devices back from a finished worker
    fn join(&mut self, worker: Worker) {
        match worker.handle.join() {
            Ok(devices) => {
                self.devices = Some(devices);
                self.status.store(VoiceStatus::Stopped.to_u8(), Ordering::Release);
            }
            Err(_) => {
                warn!("Voice listener panicked");
                self.status.store(VoiceStatus::Unavailable.to_u8(), Ordering::Release);
            }
        }
    }

    /// Join a previously abandoned worker if it has exited since
    fn reclaim_abandoned(&mut self) -> Result<()> {
        let Some(worker) = self.abandoned.take() else {
            return Ok(());
        };
        if !worker.handle.is_finished() {
            self.abandoned = Some(worker);
            return Err(Error::Voice("Previous listener is still releasing the audio devices".to_string()));
        }
        info!("Reclaiming audio devices from the abandoned listener");
        self.join(worker);
        Ok(())
    }

    /// Start if stopped, stop if running. Returns whether it is now running.
    pub fn toggle(&mut self) -> Result<bool> {
        if self.is_running() {
            self.stop();
            info!("Voice commands off");
            Ok(false)
        } else {
            self.start()?;
            info!("Voice commands on");
            Ok(true)
        }
    }
}

impl IntentSource for VoiceCommandChannel {
    fn next_intent(&mut self) -> Option<VoiceIntent> {
        self.receiver.as_ref()?.try_recv().ok()
    }
}

impl Drop for VoiceCommandChannel {
    fn drop(&mut self) {
        self.stop();
    }
}
