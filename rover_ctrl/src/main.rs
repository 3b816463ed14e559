//! # Rover Control Executable
//!
//! Connects to a single rover, optionally lets the autopilot drive it and records a run.
//!
//! The execution consists of:
//!
//!     - Initialise the session, logging and parameters
//!     - Open a client session and connect it to the rover
//!     - Engage the autopilot and start recording if asked to
//!     - Wait until the requested duration has elapsed or the link drops
//!     - Stop the run, saving it into the session directory, and disconnect

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

// External
use chrono::Utc;
use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use log::{info, warn};
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use structopt::StructOpt;

// Internal
use comms_if::rover::ConnectionStatus;
use rover_lib::{
    autopilot::SpeedMode,
    params::RoverCtrlParams,
    session_mgr::{CarIdentity, SessionMgr},
    store::SessionStore,
};
use util::{
    logger::{logger_init, LevelFilter},
    params::LoadError,
    session::Session,
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Period at which the link is checked while driving.
const WAIT_PERIOD: Duration = Duration::from_millis(100);

/// Parameter file of the control stack, relative to the params directory.
const PARAMS_FILE: &str = "rover_ctrl.toml";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "rover_ctrl", about = "Connect to a rover, drive it and record runs")]
struct Opts {
    /// Endpoint of the rover, for example `tcp://192.168.4.1:5555`.
    endpoint: String,

    /// API key presented to the rover in the handshake.
    api_key: String,

    /// Hardware id the car is registered under.
    #[structopt(long, default_value = "rover")]
    hardware_id: String,

    /// Name to register the car with if it is not known yet.
    #[structopt(long, default_value = "Rover")]
    name: String,

    /// Let the autopilot drive.
    #[structopt(long)]
    auto: bool,

    /// Record a run.
    #[structopt(long)]
    record: bool,

    /// Mark the recorded run as competitive.
    #[structopt(long)]
    competitive: bool,

    /// Speed mode of the autopilot: max, constant or min.
    #[structopt(long, default_value = "max")]
    speed: SpeedMode,

    /// Seconds to drive for, until the link drops if not given.
    #[structopt(long)]
    duration: Option<f64>,
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opts = Opts::from_args();

    // ---- EARLY INITIALISATION ----

    let (session, save_thread) =
        Session::new("rover_ctrl", "sessions").wrap_err("Failed to create the session")?;

    // Per-reading control decisions are traced, keep them out of the default output
    logger_init(
        LevelFilter::Trace,
        &[
            ("rover_lib::autopilot", LevelFilter::Debug),
            ("rover_lib::bus", LevelFilter::Debug),
        ],
        &session,
    )
    .wrap_err("Failed to initialise logging")?;

    info!("Rover Control Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let params = load_params()?;
    info!("Parameters loaded");

    // ---- CONNECT ----

    let store = Arc::new(SessionStore::new(session.clone()));
    let mgr = SessionMgr::new(params, store);
    let client = mgr.identify(None, IpAddr::V4(Ipv4Addr::LOCALHOST), Utc::now());

    let car = CarIdentity {
        hardware_id: opts.hardware_id.clone(),
        name: opts.name.clone(),
    };

    info!("Connecting to {}", opts.endpoint);
    let status = client
        .login(&opts.endpoint, &opts.api_key, &car)
        .wrap_err("Failed to connect to the rover")?;

    if status != ConnectionStatus::Ok {
        drop(client);
        drop(mgr);
        session.exit(save_thread);
        return Err(eyre!("The rover refused the connection: {:?}", status));
    }

    // ---- DRIVE ----

    client.set_speed_mode(opts.speed);

    if opts.auto {
        client
            .set_automode(true)
            .wrap_err("Failed to engage the autopilot")?;
    }

    if opts.record {
        client
            .start_run(opts.competitive)
            .wrap_err("Failed to start the run")?;
    }

    let start = Instant::now();
    let duration = opts.duration.map(Duration::from_secs_f64);

    while client.is_logged() {
        if matches!(duration, Some(d) if start.elapsed() >= d) {
            break;
        }

        client.touch(Utc::now());
        thread::sleep(WAIT_PERIOD);
    }

    if !client.is_logged() {
        warn!("Link to the rover lost ({:?})", client.link().state());
    }

    // ---- SHUTDOWN ----

    if client.recorder().is_active() {
        let summary = client.stop_run().wrap_err("Failed to stop the run")?;
        info!("Run summary: {:#?}", summary);
    }

    mgr.end(client.id());
    drop(client);
    drop(mgr);

    session.exit(save_thread);

    Ok(())
}

/// Load the parameters, using the defaults if there is no parameter file.
fn load_params() -> Result<RoverCtrlParams, Report> {
    match util::params::load(PARAMS_FILE) {
        Ok(p) => Ok(p),
        Err(LoadError::FileLoadError(e)) => {
            warn!("Could not read {} ({}), using default parameters", PARAMS_FILE, e);
            Ok(RoverCtrlParams::default())
        }
        Err(e) => Err(e).wrap_err("Failed to load the parameters"),
    }
}
