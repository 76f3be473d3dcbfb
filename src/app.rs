//! Main application loop for the AR showroom.

use crate::error::{Error, Result};
use crate::session::{Hud, InputEvent, Key, SessionController, SessionState, Tone};
use crate::voice::{IntentSource, VoiceCommandChannel, VoiceIntent, VoiceStatus};
use crate::Frame;
use log::{error, info, warn};
use std::collections::VecDeque;

/// Camera capability. An error ends the application loop.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame>;
}

/// Window capability: shows a frame with its overlay and reports key presses
pub trait Display {
    fn show(&mut self, frame: &Frame, hud: &[Hud]) -> Result<()>;

    /// Key pressed since the last poll, if any
    fn poll_key(&mut self) -> Result<Option<Key>>;
}

/// Blocking user id entry for registration
pub trait IdPrompt {
    /// `Ok(None)` when the user cancelled or input ended
    fn read_id(&mut self) -> Result<Option<String>>;
}

/// Reads user ids line by line from standard input
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl IdPrompt for StdinPrompt {
    fn read_id(&mut self) -> Result<Option<String>> {
        use std::io::Write;

        print!("Introduce tu ID de usuario (vacío para cancelar): ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let line = line.trim();
        Ok((!line.is_empty()).then(|| line.to_string()))
    }
}

fn voice_status_text(status: VoiceStatus) -> &'static str {
    match status {
        VoiceStatus::Stopped => "Voz: desactivada (V para activar)",
        VoiceStatus::Listening => "Voz: escuchando (V para desactivar)",
        VoiceStatus::BackingOff => "Voz: en pausa por errores",
        VoiceStatus::Unavailable => "Voz: no disponible",
    }
}

/// Main application struct
pub struct ShowroomApp {
    source: Box<dyn FrameSource>,
    display: Box<dyn Display>,
    prompt: Box<dyn IdPrompt>,
    session: SessionController,
    voice: Option<VoiceCommandChannel>,
}

impl ShowroomApp {
    pub fn new(
        source: Box<dyn FrameSource>,
        display: Box<dyn Display>,
        prompt: Box<dyn IdPrompt>,
        session: SessionController,
        voice: Option<VoiceCommandChannel>,
    ) -> Self {
        Self {
            source,
            display,
            prompt,
            session,
            voice,
        }
    }

    #[must_use]
    pub fn session(&self) -> &SessionController {
        &self.session
    }

    #[must_use]
    pub fn voice(&self) -> Option<&VoiceCommandChannel> {
        self.voice.as_ref()
    }

    /// Start or stop the voice listener. A missing or failing channel only logs.
    pub fn toggle_voice(&mut self) {
        match self.voice.as_mut() {
            Some(channel) => {
                if let Err(e) = channel.toggle() {
                    warn!("Voice toggle failed: {e}");
                }
            }
            None => info!("Voice commands not configured"),
        }
    }

    /// Run until the user quits or the camera fails.
    ///
    /// # Errors
    ///
    /// Returns the camera or display error that ended the loop.
    pub fn run(&mut self) -> Result<()> {
        info!("Starting main application loop");
        let result = self.run_loop();
        if let Err(e) = &result {
            error!("Main loop ended: {e}");
        }
        self.shutdown();
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut queued: Option<InputEvent> = None;
        let mut idle: VecDeque<VoiceIntent> = VecDeque::new();

        loop {
            let frame = self
                .source
                .next_frame()
                .map_err(|e| if e.is_fatal() { e } else { Error::Camera(e.to_string()) })?;

            let intents: &mut dyn IntentSource = match self.voice.as_mut() {
                Some(channel) => channel,
                None => &mut idle,
            };
            let output = self.session.step(frame, queued.take(), intents);

            let mut hud = output.hud;
            if let Some(channel) = &self.voice {
                hud.push(Hud::Status {
                    text: voice_status_text(channel.status()).to_string(),
                    tone: Tone::Hint,
                });
            }
            self.display.show(&output.frame, &hud)?;

            match self.display.poll_key()? {
                Some(Key::Letter('v')) => self.toggle_voice(),
                Some(Key::Letter('q'))
                    if matches!(self.session.state(), SessionState::Welcome | SessionState::Login) =>
                {
                    info!("Exit requested by user");
                    return Ok(());
                }
                Some(key) => queued = Some(InputEvent::Key(key)),
                None => {}
            }

            if queued.is_none() && self.session.state() == SessionState::RegisterPromptId {
                queued = Some(match self.prompt.read_id()? {
                    Some(id) => InputEvent::RegistrationId(id),
                    None => InputEvent::PromptClosed,
                });
            }
        }
    }

    /// Stop the voice listener and release the displayed model
    pub fn shutdown(&mut self) {
        if let Some(channel) = self.voice.as_mut() {
            channel.stop();
        }
        self.session.shutdown();
        info!("Application shutting down");
    }
}
