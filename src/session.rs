//! The session state machine.
//!
//! ```text
//! Welcome --L--> Login --Enter (pending match)--> MainMenu <--marker + confirm / M--> ModelViewing
//!    |             |  \--B--> Welcome
//!    R             R
//!    v             v
//! RegisterPromptId --valid id--> RegisterCapture --C x N--> RegisterTrain --> Welcome
//! ```
//!
//! One call to [`SessionController::step`] is one frame. At most one external
//! command (a key event, or else one voice intent) is applied per tick, and
//! every recoverable failure inside a tick degrades to passing the frame
//! through with a logged warning.

use crate::auth::{crop_face, AuthMatcher, FaceBox, FaceDetector, FaceMatchResult, Identity};
use crate::config::Config;
use crate::constants::{
    DEFAULT_ACCEPT_THRESHOLD, DEFAULT_REGISTRATION_SAMPLES, MAX_USER_ID_LENGTH, MENU_MARKER_ID,
};
use crate::menu::{MenuChoice, MenuEntry, MenuModel};
use crate::persistence::{IdMap, IdentityStore};
use crate::pose_estimation::{MarkerObservation, PoseEstimator};
use crate::registration::{validate_user_id, IdRejection, RegistrationSession};
use crate::render::model_resource::{ModelResource, RenderStatus};
use crate::voice::{IntentSource, NavAction, VoiceIntent};
use crate::{Frame, Result};
use log::{debug, info, warn};
use nalgebra::Point2;
use std::fmt;

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Welcome,
    Login,
    RegisterPromptId,
    RegisterCapture,
    RegisterTrain,
    MainMenu,
    ModelViewing,
}

impl SessionState {
    pub const ALL: [Self; 7] = [
        Self::Welcome,
        Self::Login,
        Self::RegisterPromptId,
        Self::RegisterCapture,
        Self::RegisterTrain,
        Self::MainMenu,
        Self::ModelViewing,
    ];

    /// Logged in, with or without a car on display
    #[must_use]
    pub const fn is_menu(self) -> bool {
        matches!(self, Self::MainMenu | Self::ModelViewing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Welcome => "WELCOME",
            Self::Login => "LOGIN",
            Self::RegisterPromptId => "REGISTER_PROMPT_ID",
            Self::RegisterCapture => "REGISTER_CAPTURE",
            Self::RegisterTrain => "REGISTER_TRAIN",
            Self::MainMenu => "MAIN_MENU",
            Self::ModelViewing => "MODEL_VIEWING",
        };
        f.write_str(name)
    }
}

/// A key press, normalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// Lowercase ASCII letter
    Letter(char),
    Digit(u8),
    Enter,
    Escape,
    Space,
}

impl Key {
    /// Decode a key code as returned by a GUI key poll. Letters are
    /// case-insensitive; negative codes mean no key.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            10 | 13 => Some(Self::Enter),
            27 => Some(Self::Escape),
            32 => Some(Self::Space),
            _ => {
                let byte = u8::try_from(code).ok()?;
                if byte.is_ascii_digit() {
                    Some(Self::Digit(byte - b'0'))
                } else if byte.is_ascii_alphabetic() {
                    Some(Self::Letter(char::from(byte.to_ascii_lowercase())))
                } else {
                    None
                }
            }
        }
    }
}

/// Input delivered to one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Key(Key),
    /// A user id typed at the registration prompt
    RegistrationId(String),
    /// The registration prompt was cancelled or hit end of input
    PromptClosed,
}

/// Styling hint for status lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Title,
    Info,
    Hint,
    Success,
    Alert,
}

/// One overlay item for the display to draw
#[derive(Debug, Clone, PartialEq)]
pub enum Hud {
    /// Text line, stacked top to bottom in order
    Status { text: String, tone: Tone },
    /// Detected face with its match label
    Face { bounds: FaceBox, label: String, accepted: bool },
    /// Outline of a detected marker
    Marker { id: i32, corners: [Point2<f64>; 4] },
    /// Menu drawn next to the menu marker
    MenuOverlay { anchor: [Point2<f64>; 4], entries: Vec<MenuEntry> },
    /// Soft warning about rendering
    Diagnostic(String),
}

/// Result of one tick
#[derive(Debug, Clone)]
pub struct TickOutput {
    pub frame: Frame,
    pub state: SessionState,
    pub hud: Vec<Hud>,
}

impl TickOutput {
    /// Status line texts in display order
    pub fn status_lines(&self) -> impl Iterator<Item = &str> {
        self.hud.iter().filter_map(|item| match item {
            Hud::Status { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    #[must_use]
    pub fn has_menu_overlay(&self) -> bool {
        self.hud.iter().any(|item| matches!(item, Hud::MenuOverlay { .. }))
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &str> {
        self.hud.iter().filter_map(|item| match item {
            Hud::Diagnostic(text) => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Tunables the controller reads once at construction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub menu_marker_id: i32,
    pub accept_threshold: f64,
    pub registration_samples: usize,
    pub max_id_length: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            menu_marker_id: MENU_MARKER_ID,
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            registration_samples: DEFAULT_REGISTRATION_SAMPLES,
            max_id_length: MAX_USER_ID_LENGTH,
        }
    }
}

impl SessionSettings {
    /// # Errors
    ///
    /// Returns an error if the selected camera profile does not exist.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            menu_marker_id: config.markers.menu_marker_id,
            accept_threshold: config.accept_threshold()?,
            registration_samples: config.registration.sample_count,
            max_id_length: config.registration.max_id_length,
        })
    }
}

/// An external command after keyboard/voice arbitration
#[derive(Debug)]
enum Command {
    Key(Key),
    RegistrationId(String),
    PromptClosed,
    Voice(VoiceIntent),
}

impl From<InputEvent> for Command {
    fn from(event: InputEvent) -> Self {
        match event {
            InputEvent::Key(key) => Self::Key(key),
            InputEvent::RegistrationId(id) => Self::RegistrationId(id),
            InputEvent::PromptClosed => Self::PromptClosed,
        }
    }
}

/// Menu-state commands
#[derive(Debug, Clone, PartialEq, Eq)]
enum MenuAction {
    /// Back to the menu from a displayed car
    ToMenu,
    Logout,
    /// Highlight an ordinal and confirm it
    Pick(usize),
    /// Confirm the highlighted entry
    Confirm,
    /// Select a car by catalog key
    Car(String),
}

impl MenuAction {
    fn from_command(command: Command) -> Option<Self> {
        match command {
            Command::Key(Key::Letter('m')) | Command::Voice(VoiceIntent::Navigate(NavAction::Menu)) => {
                Some(Self::ToMenu)
            }
            Command::Key(Key::Letter('q')) | Command::Voice(VoiceIntent::Navigate(NavAction::Logout)) => {
                Some(Self::Logout)
            }
            Command::Key(Key::Digit(digit)) => Some(Self::Pick(usize::from(digit))),
            Command::Key(Key::Space) => Some(Self::Confirm),
            Command::Voice(VoiceIntent::CarSelect(key)) => Some(Self::Car(key)),
            _ => None,
        }
    }
}

/// Commands that need this tick's perception before they can apply
#[derive(Debug, Clone, PartialEq, Eq)]
enum Deferred {
    Capture,
    Menu(MenuAction),
}

fn face_label(result: &FaceMatchResult) -> String {
    match (&result.identity, &result.candidate) {
        (Some(identity), _) => format!("{} ({:.1})", identity.id, result.confidence),
        (None, Some(candidate)) => format!("{}? ({:.1})", candidate.id, result.confidence),
        (None, None) => "Desconocido".to_string(),
    }
}

fn status(hud: &mut Vec<Hud>, tone: Tone, text: impl Into<String>) {
    hud.push(Hud::Status {
        text: text.into(),
        tone,
    });
}

/// Owns every long-lived collaborator and sequences the session
pub struct SessionController {
    settings: SessionSettings,
    state: SessionState,
    pose: PoseEstimator,
    faces: Box<dyn FaceDetector>,
    matcher: AuthMatcher,
    store: Box<dyn IdentityStore>,
    id_map: IdMap,
    menu: MenuModel,
    model: ModelResource,
    pending: Option<Identity>,
    user: Option<Identity>,
    registration: Option<RegistrationSession>,
    rejection: Option<IdRejection>,
}

impl SessionController {
    /// Build the controller and enroll every identity the store knows.
    ///
    /// Identities whose model cannot be loaded are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the threshold is invalid or the id map cannot be read.
    pub fn new(
        settings: SessionSettings,
        pose: PoseEstimator,
        faces: Box<dyn FaceDetector>,
        store: Box<dyn IdentityStore>,
        menu: MenuModel,
        model: ModelResource,
    ) -> Result<Self> {
        let mut matcher = AuthMatcher::new(settings.accept_threshold)?;
        let id_map = store.load_id_map()?;
        for identity in id_map.identities() {
            match store.load_model(&identity) {
                Ok(predictor) => matcher.enroll(identity, predictor),
                Err(e) => warn!("Skipping model for {}: {}", identity.id, e),
            }
        }
        info!(
            "Session ready: {} of {} identities enrolled, threshold {:.1}",
            matcher.len(),
            id_map.len(),
            settings.accept_threshold
        );

        Ok(Self {
            settings,
            state: SessionState::Welcome,
            pose,
            faces,
            matcher,
            store,
            id_map,
            menu,
            model,
            pending: None,
            user: None,
            registration: None,
            rejection: None,
        })
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Logged-in user
    #[must_use]
    pub fn user(&self) -> Option<&Identity> {
        self.user.as_ref()
    }

    /// Accepted face match awaiting confirmation
    #[must_use]
    pub fn pending_identity(&self) -> Option<&Identity> {
        self.pending.as_ref()
    }

    #[must_use]
    pub fn model(&self) -> &ModelResource {
        &self.model
    }

    #[must_use]
    pub fn menu(&self) -> &MenuModel {
        &self.menu
    }

    #[must_use]
    pub fn matcher(&self) -> &AuthMatcher {
        &self.matcher
    }

    #[must_use]
    pub fn id_map(&self) -> &IdMap {
        &self.id_map
    }

    #[must_use]
    pub fn registration(&self) -> Option<&RegistrationSession> {
        self.registration.as_ref()
    }

    /// Why the last proposed user id was refused
    #[must_use]
    pub fn last_rejection(&self) -> Option<&IdRejection> {
        self.rejection.as_ref()
    }

    /// Advance one frame.
    ///
    /// A key or prompt event takes the tick; otherwise one voice intent is
    /// drained. Intents drained outside the menu states are discarded.
    pub fn step(&mut self, mut frame: Frame, event: Option<InputEvent>, intents: &mut dyn IntentSource) -> TickOutput {
        let mut hud = Vec::new();

        if self.state == SessionState::RegisterTrain {
            self.finish_registration(&mut hud);
            self.present_welcome(&mut hud);
            return TickOutput {
                frame,
                state: self.state,
                hud,
            };
        }

        let command = match event {
            Some(event) => Some(Command::from(event)),
            None => intents.next_intent().and_then(|intent| {
                if self.state.is_menu() {
                    Some(Command::Voice(intent))
                } else {
                    debug!("Discarding voice intent {:?} in {}", intent, self.state);
                    None
                }
            }),
        };
        let deferred = command.and_then(|command| self.apply(command));

        match self.state {
            SessionState::Welcome => self.present_welcome(&mut hud),
            SessionState::Login => self.present_login(&frame, &mut hud),
            SessionState::RegisterPromptId => self.present_prompt(&mut hud),
            SessionState::RegisterCapture => {
                self.present_capture(&frame, deferred == Some(Deferred::Capture), &mut hud);
            }
            SessionState::RegisterTrain => self.present_training(&mut hud),
            SessionState::MainMenu | SessionState::ModelViewing => {
                let action = match deferred {
                    Some(Deferred::Menu(action)) => Some(action),
                    _ => None,
                };
                self.present_menu(&mut frame, action, &mut hud);
            }
        }

        TickOutput {
            frame,
            state: self.state,
            hud,
        }
    }

    /// Release the displayed car, if any
    pub fn shutdown(&mut self) {
        self.model.cleanup();
        info!("Session shut down in {}", self.state);
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            info!("{} -> {}", self.state, to);
            self.state = to;
        }
    }

    /// Logout paths: forget the user and release the car
    fn teardown(&mut self, to: SessionState) {
        self.user = None;
        self.pending = None;
        self.registration = None;
        self.model.cleanup();
        self.menu.reset();
        self.transition(to);
    }

    /// Apply state edges that need no perception; return the rest
    fn apply(&mut self, command: Command) -> Option<Deferred> {
        match (self.state, command) {
            (SessionState::Welcome, Command::Key(Key::Letter('l'))) => {
                self.pending = None;
                self.transition(SessionState::Login);
            }
            (SessionState::Welcome | SessionState::Login, Command::Key(Key::Letter('r'))) => {
                self.pending = None;
                self.rejection = None;
                self.transition(SessionState::RegisterPromptId);
            }
            (SessionState::Login, Command::Key(Key::Enter)) => match self.pending.take() {
                Some(identity) => {
                    info!("Login confirmed for {identity}");
                    self.user = Some(identity);
                    self.menu.reset();
                    self.transition(SessionState::MainMenu);
                }
                None => debug!("Enter ignored: no accepted face"),
            },
            (SessionState::Login, Command::Key(Key::Letter('b'))) => {
                self.pending = None;
                self.transition(SessionState::Welcome);
            }
            (SessionState::RegisterPromptId, Command::RegistrationId(raw)) => {
                match validate_user_id(&raw, &self.id_map, self.settings.max_id_length) {
                    Ok(user_id) => {
                        info!("Registering new user {user_id}");
                        self.rejection = None;
                        self.registration = Some(RegistrationSession::new(
                            user_id,
                            self.settings.registration_samples,
                        ));
                        self.transition(SessionState::RegisterCapture);
                    }
                    Err(rejection) => {
                        info!("Rejected user id '{}': {}", raw.trim(), rejection);
                        self.rejection = Some(rejection);
                    }
                }
            }
            (SessionState::RegisterPromptId, Command::PromptClosed | Command::Key(Key::Escape)) => {
                info!("Registration cancelled");
                self.rejection = None;
                self.transition(SessionState::Welcome);
            }
            (SessionState::RegisterCapture, Command::Key(Key::Letter('c'))) => return Some(Deferred::Capture),
            (SessionState::RegisterCapture, Command::Key(Key::Escape)) => {
                info!("Registration cancelled");
                self.registration = None;
                self.transition(SessionState::Welcome);
            }
            (SessionState::MainMenu | SessionState::ModelViewing, command) => {
                match MenuAction::from_command(command)? {
                    MenuAction::ToMenu => {
                        if self.state == SessionState::ModelViewing {
                            self.model.cleanup();
                            self.menu.reset();
                            self.transition(SessionState::MainMenu);
                        } else {
                            debug!("Already in the menu");
                        }
                    }
                    MenuAction::Logout => {
                        info!("Logging out");
                        self.teardown(SessionState::Welcome);
                    }
                    action => return Some(Deferred::Menu(action)),
                }
            }
            (state, command) => debug!("No edge for {command:?} in {state}"),
        }
        None
    }

    fn present_welcome(&self, hud: &mut Vec<Hud>) {
        status(hud, Tone::Title, "Bienvenido a AR Showroom");
        status(hud, Tone::Info, "Presiona 'L' para Iniciar Sesion");
        status(hud, Tone::Info, "Presiona 'R' para Registrar Nuevo Usuario");
        status(hud, Tone::Hint, "Presiona 'Q' para Salir");
    }

    fn detect_faces(&mut self, frame: &Frame) -> Vec<FaceBox> {
        self.faces.detect(frame).unwrap_or_else(|e| {
            warn!("Face detection failed: {e}");
            Vec::new()
        })
    }

    fn present_login(&mut self, frame: &Frame, hud: &mut Vec<Hud>) {
        status(hud, Tone::Title, "Estado: LOGIN FACIAL");

        if self.pending.is_none() {
            for face in self.detect_faces(frame) {
                let crop = match crop_face(frame, &face) {
                    Ok(crop) => crop,
                    Err(e) => {
                        warn!("Skipping face: {e}");
                        continue;
                    }
                };
                let result = self.matcher.match_face(&crop);
                hud.push(Hud::Face {
                    bounds: face,
                    label: face_label(&result),
                    accepted: result.is_accepted(),
                });
                if let Some(identity) = result.identity {
                    info!(
                        "Face accepted as {} ({:.1}); waiting for confirmation",
                        identity.id, result.confidence
                    );
                    self.pending = Some(identity);
                    break;
                }
            }
        }

        match &self.pending {
            Some(identity) => {
                status(hud, Tone::Success, format!("Bienvenido {}!", identity.id));
                status(hud, Tone::Hint, "Presiona ENTER para continuar");
            }
            None => status(hud, Tone::Info, "Coloca tu rostro para identificarte..."),
        }
        status(hud, Tone::Hint, "Presiona 'B' para Volver al Menu Inicial");
    }

    fn present_prompt(&self, hud: &mut Vec<Hud>) {
        status(hud, Tone::Title, "REGISTRO: introduce tu ID en la terminal");
        if let Some(rejection) = &self.rejection {
            status(hud, Tone::Alert, format!("ID rechazado: {rejection}"));
        }
        status(hud, Tone::Hint, "Presiona 'ESC' para cancelar");
    }

    fn present_capture(&mut self, frame: &Frame, capture: bool, hud: &mut Vec<Hud>) {
        let faces = self.detect_faces(frame);
        for face in &faces {
            hud.push(Hud::Face {
                bounds: *face,
                label: String::new(),
                accepted: faces.len() == 1,
            });
        }

        if capture {
            self.capture_sample(frame, &faces);
            if self.state == SessionState::RegisterTrain {
                self.present_training(hud);
                return;
            }
        }

        let Some(session) = &self.registration else {
            return;
        };
        status(hud, Tone::Title, format!("Registrando: {}", session.user_id()));
        status(
            hud,
            Tone::Info,
            format!("Capturadas: {}/{}", session.captured(), session.target()),
        );
        match faces.len() {
            0 => status(hud, Tone::Hint, "Muestra tu rostro a la camara"),
            1 => status(hud, Tone::Hint, "Mueve la cabeza. Presiona 'C' para Capturar"),
            _ => status(hud, Tone::Alert, "Solo un rostro permitido para registro"),
        }
        status(hud, Tone::Hint, "Presiona 'ESC' para Cancelar Registro");
    }

    fn capture_sample(&mut self, frame: &Frame, faces: &[FaceBox]) {
        let [face] = faces else {
            info!("Capture needs exactly one face, saw {}", faces.len());
            return;
        };
        let crop = match crop_face(frame, face) {
            Ok(crop) => crop,
            Err(e) => {
                warn!("Could not crop face: {e}");
                return;
            }
        };
        let Some(session) = self.registration.as_mut() else {
            return;
        };
        let complete = session.add_sample(crop);
        debug!("Captured {}/{}", session.captured(), session.target());
        if complete {
            self.transition(SessionState::RegisterTrain);
        }
    }

    fn present_training(&self, hud: &mut Vec<Hud>) {
        let user_id = self.registration.as_ref().map_or("", RegistrationSession::user_id);
        status(hud, Tone::Title, format!("Entrenando modelo para: {user_id}..."));
        status(hud, Tone::Hint, "Esto puede tardar unos segundos.");
    }

    /// Train and persist, then always return to Welcome
    fn finish_registration(&mut self, hud: &mut Vec<Hud>) {
        if let Some(session) = self.registration.take() {
            match self.train(&session) {
                Ok(identity) => {
                    info!("Registered {identity}");
                    status(hud, Tone::Success, format!("Usuario {} registrado", identity.id));
                }
                Err(e) => {
                    warn!("Training for {} failed: {}", session.user_id(), e);
                    status(hud, Tone::Alert, format!("Error registrando {}", session.user_id()));
                }
            }
        }
        self.transition(SessionState::Welcome);
    }

    fn train(&mut self, session: &RegistrationSession) -> Result<Identity> {
        let mut id_map = self.id_map.clone();
        let identity = id_map.assign(session.user_id())?;
        let predictor = self.store.save_model(&identity, session.samples())?;
        self.store.save_id_map(&id_map)?;
        self.id_map = id_map;
        self.matcher.enroll(identity.clone(), predictor);
        Ok(identity)
    }

    fn present_menu(&mut self, frame: &mut Frame, action: Option<MenuAction>, hud: &mut Vec<Hud>) {
        let observations = self.pose.estimate(frame).unwrap_or_else(|e| {
            warn!("Marker detection failed: {e}");
            Vec::new()
        });
        let anchor = observations
            .iter()
            .find(|o| o.marker_id == self.settings.menu_marker_id)
            .cloned();

        if let Some(action) = action {
            if anchor.is_some() {
                self.apply_menu_action(action, frame.width(), frame.height(), hud);
            } else {
                info!("Ignoring {action:?}: menu marker {} not visible", self.settings.menu_marker_id);
            }
            if !self.state.is_menu() {
                return;
            }
        }

        for observation in &observations {
            hud.push(Hud::Marker {
                id: observation.marker_id,
                corners: observation.corners,
            });
        }
        let car_name = self.model.definition().map(|car| car.name.clone());
        match &car_name {
            Some(name) => status(hud, Tone::Title, format!("Estado: {} SHOWROOM", name.to_uppercase())),
            None => status(hud, Tone::Title, "Estado: CAR SHOWROOM - Selecciona tu coche"),
        }
        if let Some(user) = &self.user {
            status(hud, Tone::Success, format!("Bienvenido, {}!", user.id));
        }

        let marker_id = self.settings.menu_marker_id;
        match (anchor, car_name) {
            (Some(observation), None) => {
                hud.push(Hud::MenuOverlay {
                    anchor: observation.corners,
                    entries: self.menu.entries(),
                });
                status(
                    hud,
                    Tone::Hint,
                    format!("1-{}: Seleccionar | ESPACIO: Ver modelo 3D", self.menu.catalog().len()),
                );
            }
            (Some(observation), Some(name)) => self.render_model(frame, &observation, &name, hud),
            (None, Some(name)) => {
                status(hud, Tone::Success, format!("Coche seleccionado: {name}"));
                status(hud, Tone::Hint, format!("Muestra marcador ID {marker_id} para ver modelo 3D"));
                status(hud, Tone::Hint, "Presiona 'M' para volver al menu sin marcador");
            }
            (None, None) => {
                status(hud, Tone::Alert, format!("Muestra marcador ID {marker_id} para abrir menu"));
                let names: Vec<&str> = self.menu.catalog().iter().map(|car| car.name.as_str()).collect();
                if !names.is_empty() {
                    status(hud, Tone::Info, format!("Selecciona {}", names.join(" o ")));
                }
            }
        }
    }

    fn apply_menu_action(&mut self, action: MenuAction, width: u32, height: u32, hud: &mut Vec<Hud>) {
        match action {
            MenuAction::Pick(ordinal) => {
                let catalog = self.menu.catalog();
                if catalog.is_empty() || ordinal > catalog.len() {
                    debug!("Menu ordinal {ordinal} out of range");
                    return;
                }
                self.menu.select(ordinal);
            }
            MenuAction::Car(key) => {
                let Some(ordinal) = self.menu.catalog().ordinal_of(&key) else {
                    warn!("Voice selected unknown car '{key}'");
                    return;
                };
                self.menu.select(ordinal);
            }
            MenuAction::Confirm => {}
            MenuAction::ToMenu | MenuAction::Logout => return,
        }

        let car = match self.menu.confirm() {
            None => return,
            Some(MenuChoice::Back) => {
                info!("Back to login");
                self.teardown(SessionState::Login);
                return;
            }
            Some(MenuChoice::Car(car)) => car.clone(),
        };

        match self.model.load(&car, width, height) {
            Ok(()) => {
                info!("Showing {}", car.name);
                self.transition(SessionState::ModelViewing);
            }
            Err(e) => {
                warn!("Could not load {}: {}", car.name, e);
                self.model.cleanup();
                hud.push(Hud::Diagnostic(format!("Error cargando {}", car.name)));
                self.transition(SessionState::MainMenu);
            }
        }
    }

    fn render_model(&mut self, frame: &mut Frame, observation: &MarkerObservation, name: &str, hud: &mut Vec<Hud>) {
        let (intrinsics, _) = self.pose.intrinsics_for(frame.width(), frame.height());
        match self.model.render(frame, observation, &intrinsics) {
            Ok(RenderStatus::Composited { visible_pixels }) => {
                debug!("{name}: {visible_pixels} visible pixels");
                status(hud, Tone::Success, name);
                status(hud, Tone::Hint, "M: Menu | Q: Logout");
            }
            Ok(RenderStatus::NoVisiblePixels) => {
                warn!("{name} rendered no visible pixels");
                hud.push(Hud::Diagnostic(format!("{name} (invisible)")));
            }
            Ok(RenderStatus::Skipped) => debug!("{name} not ready"),
            Err(e) => {
                warn!("Rendering {name} failed: {e}; back to the menu");
                self.model.cleanup();
                self.menu.reset();
                self.transition(SessionState::MainMenu);
                hud.push(Hud::Diagnostic(format!("Error: {name}")));
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.model.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_codes() {
        assert_eq!(Key::from_code(13), Some(Key::Enter));
        assert_eq!(Key::from_code(10), Some(Key::Enter));
        assert_eq!(Key::from_code(27), Some(Key::Escape));
        assert_eq!(Key::from_code(32), Some(Key::Space));
        assert_eq!(Key::from_code(i32::from(b'L')), Some(Key::Letter('l')));
        assert_eq!(Key::from_code(i32::from(b'q')), Some(Key::Letter('q')));
        assert_eq!(Key::from_code(i32::from(b'7')), Some(Key::Digit(7)));
        assert_eq!(Key::from_code(-1), None);
        assert_eq!(Key::from_code(255), None);
        assert_eq!(Key::from_code(i32::from(b'+')), None);
    }

    #[test]
    fn test_face_labels() {
        let identity = Identity {
            id: "ana".to_string(),
            numeric_id: 0,
        };
        let accepted = FaceMatchResult {
            identity: Some(identity.clone()),
            confidence: 30.0,
            candidate: Some(identity.clone()),
        };
        assert_eq!(face_label(&accepted), "ana (30.0)");

        let rejected = FaceMatchResult {
            identity: None,
            confidence: 72.25,
            candidate: Some(identity),
        };
        assert_eq!(face_label(&rejected), "ana? (72.2)");

        let unknown = FaceMatchResult {
            identity: None,
            confidence: f64::INFINITY,
            candidate: None,
        };
        assert_eq!(face_label(&unknown), "Desconocido");
    }

    #[test]
    fn test_menu_actions_from_commands() {
        assert_eq!(
            MenuAction::from_command(Command::Key(Key::Letter('m'))),
            Some(MenuAction::ToMenu)
        );
        assert_eq!(
            MenuAction::from_command(Command::Voice(VoiceIntent::Navigate(NavAction::Logout))),
            Some(MenuAction::Logout)
        );
        assert_eq!(
            MenuAction::from_command(Command::Key(Key::Digit(2))),
            Some(MenuAction::Pick(2))
        );
        assert_eq!(
            MenuAction::from_command(Command::Voice(VoiceIntent::CarSelect("porsche".to_string()))),
            Some(MenuAction::Car("porsche".to_string()))
        );
        assert_eq!(MenuAction::from_command(Command::Key(Key::Enter)), None);
        assert_eq!(MenuAction::from_command(Command::PromptClosed), None);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.registration.sample_count = 3;
        let settings = SessionSettings::from_config(&config).unwrap();
        assert_eq!(settings.registration_samples, 3);
        assert_eq!(settings.menu_marker_id, 23);
        assert_eq!(settings.accept_threshold, 50.0);

        config.camera.profile = "droidcam".to_string();
        assert_eq!(SessionSettings::from_config(&config).unwrap().accept_threshold, 60.0);
    }
}
