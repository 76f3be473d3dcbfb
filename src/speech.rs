//! Microphone capture through `cpal` and speech-to-text over HTTP.
//!
//! [`CpalAudioSource`] records one energy-gated phrase per call from the
//! default input device; [`HttpTranscriber`] uploads it as a 16-bit WAV to a
//! transcription server (the whisper.cpp `/inference` contract).

use crate::config::VoiceConfig;
use crate::voice::{AudioClip, AudioSource, Transcriber, TranscriptionError};
use crate::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use log::{debug, info, warn};
use serde::Deserialize;
use std::io::Cursor;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Extra wall-clock slack before a silent device counts as stalled
const STALL_GRACE: Duration = Duration::from_millis(500);

fn samples_in(duration: Duration, sample_rate: u32) -> usize {
    usize::try_from(duration.as_millis() * u128::from(sample_rate) / 1000).unwrap_or(usize::MAX)
}

/// Root mean square of a chunk on the 16-bit scale
fn rms(chunk: &[i16]) -> f64 {
    if chunk.is_empty() {
        return 0.0;
    }
    let energy: f64 = chunk.iter().map(|&s| f64::from(s).powi(2)).sum();
    (energy / chunk.len() as f64).sqrt()
}

/// Splits a stream of mono chunks into one phrase
#[derive(Debug, Clone, Copy, PartialEq)]
struct PhraseGate {
    energy_threshold: f64,
    pause: Duration,
}

impl PhraseGate {
    /// Wait `timeout` of audio for a loud chunk, then record until `pause`
    /// of trailing silence or `phrase_limit`. `Ok(None)` when nobody spoke.
    fn record(
        &self,
        chunks: &Receiver<Vec<i16>>,
        sample_rate: u32,
        timeout: Duration,
        phrase_limit: Duration,
    ) -> Result<Option<AudioClip>> {
        let wait_samples = samples_in(timeout, sample_rate);
        let phrase_samples = samples_in(phrase_limit, sample_rate);
        let pause_samples = samples_in(self.pause, sample_rate);
        let stall = timeout.max(phrase_limit) + STALL_GRACE;

        let mut waited = 0;
        let mut silent_run = 0;
        let mut phrase: Vec<i16> = Vec::new();
        loop {
            let chunk = match chunks.recv_timeout(stall) {
                Ok(chunk) => chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::Voice("Microphone stopped delivering audio".to_string()))
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let loud = rms(&chunk) >= self.energy_threshold;

            if phrase.is_empty() && !loud {
                waited += chunk.len();
                if waited >= wait_samples {
                    return Ok(None);
                }
                continue;
            }

            silent_run = if loud { 0 } else { silent_run + chunk.len() };
            phrase.extend_from_slice(&chunk);
            if phrase.len() >= phrase_samples || silent_run >= pause_samples {
                break;
            }
        }

        if phrase.is_empty() {
            return Ok(None);
        }
        phrase.truncate(phrase_samples.max(1));
        debug!("Captured {} samples at {} Hz", phrase.len(), sample_rate);
        Ok(Some(AudioClip {
            samples: phrase,
            sample_rate,
        }))
    }
}

/// Default input device, opened fresh for every capture
pub struct CpalAudioSource {
    gate: PhraseGate,
}

impl CpalAudioSource {
    /// Check that an input device exists.
    ///
    /// # Errors
    ///
    /// Returns `Voice` when the host has no default input device.
    pub fn open(config: &VoiceConfig) -> Result<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::Voice("No microphone found".to_string()))?;
        info!("Microphone: {}", device.name().unwrap_or_else(|_| "unknown".to_string()));
        Ok(Self {
            gate: PhraseGate {
                energy_threshold: config.energy_threshold,
                pause: config.pause(),
            },
        })
    }
}

fn device_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Voice(format!("{context}: {e}"))
}

fn input_stream<T>(device: &cpal::Device, config: &StreamConfig, sender: Sender<Vec<i16>>) -> Result<cpal::Stream>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // First channel only
                let mono = data.chunks(channels).map(|frame| i16::from_sample(frame[0])).collect();
                // The receiver is gone once the phrase is complete
                let _ = sender.send(mono);
            },
            |e| warn!("Microphone stream error: {e}"),
            None,
        )
        .map_err(|e| device_error("Failed to open microphone stream", e))
}

impl AudioSource for CpalAudioSource {
    fn capture(&mut self, timeout: Duration, phrase_limit: Duration) -> Result<Option<AudioClip>> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::Voice("Microphone disconnected".to_string()))?;
        let supported = device
            .default_input_config()
            .map_err(|e| device_error("Failed to query microphone", e))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.config();

        let (sender, receiver) = mpsc::channel();
        let stream = match sample_format {
            SampleFormat::F32 => input_stream::<f32>(&device, &config, sender)?,
            SampleFormat::I16 => input_stream::<i16>(&device, &config, sender)?,
            SampleFormat::U16 => input_stream::<u16>(&device, &config, sender)?,
            other => return Err(Error::Voice(format!("Unsupported microphone format {other:?}"))),
        };
        stream.play().map_err(|e| device_error("Failed to start microphone", e))?;

        let clip = self.gate.record(&receiver, config.sample_rate.0, timeout, phrase_limit);
        drop(stream);
        clip
    }
}

/// Mono 16-bit WAV bytes for `clip`
fn encode_wav(clip: &AudioClip) -> std::result::Result<Vec<u8>, TranscriptionError> {
    let format = hound::WavSpec {
        channels: 1,
        sample_rate: clip.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let encode_error = |e: hound::Error| TranscriptionError::Other(format!("WAV encoding failed: {e}"));

    let mut bytes = Vec::new();
    let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), format).map_err(encode_error)?;
    for &sample in &clip.samples {
        writer.write_sample(sample).map_err(encode_error)?;
    }
    writer.finalize().map_err(encode_error)?;
    Ok(bytes)
}

#[derive(Debug, Deserialize)]
struct TranscriptResponse {
    #[serde(default)]
    text: String,
}

/// Text of a server reply; blank text means nothing intelligible was heard
fn parse_transcript(body: &str) -> std::result::Result<Option<String>, TranscriptionError> {
    let response: TranscriptResponse = serde_json::from_str(body)
        .map_err(|e| TranscriptionError::Other(format!("Unexpected transcription reply: {e}")))?;
    let text = response.text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

/// Server-side and throttling failures back off like an unreachable service
fn status_error(status: reqwest::StatusCode, body: &str) -> TranscriptionError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        TranscriptionError::Service(message)
    } else {
        TranscriptionError::Other(message)
    }
}

/// Uploads clips to a speech-to-text HTTP endpoint
pub struct HttpTranscriber {
    client: reqwest::blocking::Client,
    url: String,
    language: String,
}

impl HttpTranscriber {
    /// # Errors
    ///
    /// Returns `Voice` if the HTTP client cannot be built.
    pub fn from_config(config: &VoiceConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.transcribe_timeout())
            .build()
            .map_err(|e| device_error("Failed to create transcription client", e))?;
        info!("Transcribing speech via {} ({})", config.transcriber_url, config.language);
        Ok(Self {
            client,
            url: config.transcriber_url.clone(),
            language: config.language.clone(),
        })
    }
}

impl Transcriber for HttpTranscriber {
    fn transcribe(&mut self, clip: &AudioClip) -> std::result::Result<Option<String>, TranscriptionError> {
        let wav = reqwest::blocking::multipart::Part::bytes(encode_wav(clip)?)
            .file_name("phrase.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Other(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new()
            .part("file", wav)
            .text("language", self.language.clone())
            .text("response_format", "json");

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .map_err(|e| TranscriptionError::Service(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| TranscriptionError::Service(e.to_string()))?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        parse_transcript(&body)
    }
}
