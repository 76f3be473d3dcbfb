//! AR showroom application: face login, marker menu and car viewing.

use anyhow::Result;
use ar_showroom::config::{Config, EXAMPLE_CONFIG};
#[cfg(feature = "opencv")]
use ar_showroom::{catalog::Catalog, voice::VoiceCommandChannel};
use clap::Parser;
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Camera index to use (overrides the configuration)
    #[arg(long)]
    cam: Option<i32>,

    /// Path to configuration file (YAML format)
    #[arg(short = 'C', long)]
    config: Option<String>,

    /// Camera intrinsics profile (`estimated` or a configured profile name)
    #[arg(long)]
    profile: Option<String>,

    /// Face acceptance threshold (lower is stricter)
    #[arg(long)]
    threshold: Option<f64>,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            match Config::from_file(path) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to load config file: {}. Using defaults.", e);
                    Config::default()
                }
            }
        }
        None => Config::default(),
    };

    if let Some(cam) = args.cam {
        config.camera.device = cam;
    }
    if let Some(profile) = &args.profile {
        config.camera.profile.clone_from(profile);
    }
    if let Some(threshold) = args.threshold {
        // An explicit threshold wins over any profile override.
        config.auth.accept_threshold = threshold;
        for profile in config.camera.profiles.values_mut() {
            profile.accept_threshold = None;
        }
    }
    config.validate()?;
    Ok(config)
}

#[cfg(all(feature = "opencv", feature = "voice"))]
fn voice_channel(config: &Config, catalog: &Catalog) -> Option<VoiceCommandChannel> {
    use ar_showroom::speech::{CpalAudioSource, HttpTranscriber};
    use ar_showroom::voice::{KeywordMatcher, VoiceTiming};

    let devices = CpalAudioSource::open(&config.voice)
        .and_then(|audio| Ok((audio, HttpTranscriber::from_config(&config.voice)?)));
    match devices {
        Ok((audio, transcriber)) => Some(VoiceCommandChannel::new(
            Box::new(audio),
            Box::new(transcriber),
            KeywordMatcher::from_catalog(catalog, &config.voice),
            VoiceTiming::from(&config.voice),
            config.voice.queue_capacity,
        )),
        Err(e) => {
            warn!("Voice commands unavailable: {e}");
            None
        }
    }
}

#[cfg(all(feature = "opencv", not(feature = "voice")))]
fn voice_channel(_config: &Config, _catalog: &Catalog) -> Option<VoiceCommandChannel> {
    warn!("Voice commands unavailable: built without the `voice` feature");
    None
}

#[cfg(feature = "opencv")]
fn run(config: &Config) -> Result<()> {
    use ar_showroom::app::{ShowroomApp, StdinPrompt};
    use ar_showroom::backend::{
        ArucoMarkerDetector, CameraSource, HaarFaceDetector, HighguiDisplay, LbphBackend, PnpPoseSolver,
    };
    use ar_showroom::menu::MenuModel;
    use ar_showroom::persistence::FileIdentityStore;
    use ar_showroom::pose_estimation::PoseEstimator;
    use ar_showroom::render::model_resource::ModelResource;
    use ar_showroom::render::mesh_loader::MeshFileLoader;
    use ar_showroom::render::software::SoftwareRenderer;
    use ar_showroom::session::{SessionController, SessionSettings};

    let catalog = config.catalog()?;
    let mut voice = voice_channel(config, &catalog);
    if config.voice.enabled_on_start {
        if let Some(channel) = voice.as_mut() {
            if let Err(e) = channel.start() {
                warn!("Voice listener failed to start: {e}");
            }
        }
    }

    let model = ModelResource::new(
        Box::new(MeshFileLoader::new()),
        Box::new(SoftwareRenderer::new()),
        catalog.asset_root(),
    );
    let pose = PoseEstimator::new(
        Box::new(ArucoMarkerDetector::new()?),
        config.camera_model()?,
        config.markers.marker_size_meters,
    )?
    .with_solver(Box::new(PnpPoseSolver))
    .with_filter(config.create_pose_filter()?);
    let store = FileIdentityStore::new(
        &config.storage.id_map_path,
        &config.storage.models_dir,
        &config.storage.samples_dir,
        LbphBackend,
    );

    let session = SessionController::new(
        SessionSettings::from_config(config)?,
        pose,
        Box::new(HaarFaceDetector::new(&config.storage.face_cascade)?),
        Box::new(store),
        MenuModel::new(catalog),
        model,
    )?;

    let mut app = ShowroomApp::new(
        Box::new(CameraSource::open(config.camera.device)?),
        Box::new(HighguiDisplay::new(&config.display.window_name, config.display.poll_delay_ms)?),
        Box::new(StdinPrompt),
        session,
        voice,
    );
    app.run()?;
    Ok(())
}

#[cfg(not(feature = "opencv"))]
fn run(_config: &Config) -> Result<()> {
    anyhow::bail!("Built without camera support; rebuild with `--features opencv`")
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    if args.print_config {
        print!("{EXAMPLE_CONFIG}");
        return Ok(());
    }

    // Initialize logger
    if args.debug {
        env_logger::init_from_env(env_logger::Env::new().default_filter_or("debug"));
    } else {
        env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    }

    info!("AR Showroom");

    let config = load_config(&args)?;
    run(&config)
}
