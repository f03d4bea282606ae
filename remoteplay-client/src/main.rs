use std::{net::IpAddr, path::PathBuf, process::exit, time::Duration};

use clap::{Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use remoteplay_common::{
    Fps, RemotePlayError, Resolution, ddp,
    device::Device,
    profile::Profiles,
    register,
    session::{Session, SessionEvent, SessionOptions, SessionState},
    stream::av::{ChannelSink, FileSink, FrameSink},
    tracker::{DeviceTracker, TrackerEvent},
};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

#[derive(Parser)]
#[command(version, about = "Remote Play client", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path of the profile store
    #[arg(long, default_value = "remoteplay-profiles.json")]
    profiles: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search the local network for consoles
    Discover {
        /// Poll one address instead of broadcasting
        #[arg(long)]
        host: Option<IpAddr>,
        /// Keep watching and print status changes
        #[arg(long)]
        watch: bool,
    },
    /// Register this client with a console
    Register {
        host: IpAddr,
        /// Profile name the credential is stored under
        #[arg(long)]
        user: String,
        /// PSN account id (base64)
        #[arg(long)]
        psn_id: String,
        /// The 8-digit PIN shown by the console
        #[arg(long)]
        pin: u32,
    },
    /// Connect to a console and stream
    Connect {
        host: IpAddr,
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "720p")]
        resolution: Resolution,
        #[arg(long, default_value = "high")]
        fps: Fps,
        /// Write the encoded video stream to this file instead of keeping
        /// frames in memory
        #[arg(long)]
        output: Option<PathBuf>,
        /// Send a wakeup first if the console is in standby
        #[arg(long)]
        wakeup: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("logger");

    if let Err(err) = run(cli).await {
        error!("{err}");
        exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), RemotePlayError> {
    match cli.command {
        Command::Discover { host, watch } => discover(host, watch).await,
        Command::Register {
            host,
            user,
            psn_id,
            pin,
        } => do_register(&cli.profiles, host, &user, &psn_id, pin).await,
        Command::Connect {
            host,
            user,
            resolution,
            fps,
            output,
            wakeup,
        } => {
            connect(
                &cli.profiles,
                host,
                &user,
                SessionOptions {
                    resolution,
                    fps,
                    hdr: false,
                },
                output,
                wakeup,
            )
            .await
        }
    }
}

async fn discover(host: Option<IpAddr>, watch: bool) -> Result<(), RemotePlayError> {
    if !watch {
        let found = ddp::search(host, ddp::SEARCH_TIMEOUT).await?;
        if found.is_empty() {
            warn!("no consoles found");
            return Ok(());
        }
        for status in found {
            println!(
                "{}  {}  {}  status {} {}",
                status.host_ip.map(|ip| ip.to_string()).unwrap_or_default(),
                status.host_type.as_deref().unwrap_or("?"),
                status.host_name.as_deref().unwrap_or("?"),
                status.code,
                status.running_app_name.as_deref().unwrap_or(""),
            );
        }
        return Ok(());
    }

    let (mut tracker, mut events) = DeviceTracker::new();
    if let Some(host) = host {
        tracker.add_device(host);
    }
    let shutdown = tracker.shutdown_handle();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TrackerEvent::StatusUpdated { host, status } => {
                    println!(
                        "{host}: {} {} ({})",
                        status.code,
                        status.status,
                        status.host_name.as_deref().unwrap_or("?")
                    );
                }
                TrackerEvent::StatusLost { host } => println!("{host}: lost"),
            }
        }
    });

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.stop();
    });
    tracker.run(Duration::from_secs(1)).await?;
    printer.abort();
    Ok(())
}

fn load_profiles(path: &PathBuf) -> Result<Profiles, RemotePlayError> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .map_err(|err| RemotePlayError::Protocol(format!("bad profile store: {err}"))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Profiles::default()),
        Err(err) => Err(err.into()),
    }
}

fn store_profiles(path: &PathBuf, profiles: &Profiles) -> Result<(), RemotePlayError> {
    let raw = serde_json::to_vec_pretty(profiles)
        .map_err(|err| RemotePlayError::Protocol(format!("profile encode: {err}")))?;
    std::fs::write(path, raw)?;
    Ok(())
}

async fn do_register(
    profiles_path: &PathBuf,
    host: IpAddr,
    user: &str,
    psn_id: &str,
    pin: u32,
) -> Result<(), RemotePlayError> {
    let mut profiles = load_profiles(profiles_path)?;

    let record = register::register(host, psn_id, pin, register::DEFAULT_TIMEOUT).await?;
    println!(
        "registered with {} \"{}\" ({})",
        record.kind, record.nickname, record.mac
    );

    let entry = profiles.0.entry(user.to_string()).or_default();
    if entry.id.is_empty() {
        entry.id = psn_id.to_string();
    }
    entry.update_host(&record);
    store_profiles(profiles_path, &profiles)?;
    info!("profile store updated: {}", profiles_path.display());
    Ok(())
}

async fn connect(
    profiles_path: &PathBuf,
    host: IpAddr,
    user: &str,
    options: SessionOptions,
    output: Option<PathBuf>,
    wakeup: bool,
) -> Result<(), RemotePlayError> {
    let profiles = load_profiles(profiles_path)?;
    let profile = profiles
        .user(user)
        .ok_or_else(|| RemotePlayError::Protocol(format!("unknown user {user}")))?;

    // Find the device and match it to a stored credential.
    let mut device = Device::new(host);
    let status = ddp::status(host, ddp::SEARCH_TIMEOUT)
        .await?
        .ok_or(RemotePlayError::Unreachable)?;
    device.set_status(Some(status));
    let mac = device
        .host_id()
        .ok_or_else(|| RemotePlayError::Protocol("console did not report its id".into()))?;
    let host_profile = profile.host(mac).ok_or_else(|| {
        RemotePlayError::Protocol(format!("user {user} is not registered with {mac}"))
    })?;

    if wakeup && device.is_standby() {
        let regist_key = host_profile
            .regist_key()
            .ok_or_else(|| RemotePlayError::Protocol("profile has no regist key".into()))?;
        info!("host is in standby, sending wakeup");
        ddp::wakeup(
            host,
            host_profile.kind,
            ddp::credential_from_regist_key(regist_key)?,
        )
        .await?;
        return Err(RemotePlayError::Unreachable);
    }

    // Pick the output: a file for the raw video stream, or in-memory
    // receivers that are drained and counted.
    let (sink, receivers): (Box<dyn FrameSink>, _) = match &output {
        Some(path) => (Box::new(FileSink::create(path)?), None),
        None => {
            let (sink, receivers) = ChannelSink::new();
            (Box::new(sink), Some(receivers))
        }
    };
    if let Some(mut receivers) = receivers {
        tokio::spawn(async move {
            let mut frames: u64 = 0;
            while let Some(frame) = receivers.video.recv().await {
                frames += 1;
                if frames % 300 == 0 {
                    info!("{frames} video frames received (last {} bytes)", frame.len());
                }
            }
        });
    }

    let mut session = Session::new(&device, host_profile, options, sink)?;
    let mut events = session.take_events().expect("session events");
    session.start().await?;
    info!("session running; press ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("stopping");
                break;
            }
            event = events.recv() => match event {
                Some(SessionEvent::StateChanged(state)) => {
                    info!("session state: {state:?}");
                    if state == SessionState::Stopped {
                        break;
                    }
                }
                Some(SessionEvent::AudioConfig(config)) => {
                    info!(
                        "audio: {} channels at {} Hz",
                        config.channels, config.rate
                    );
                }
                None => break,
            },
        }
    }
    session.stop().await;

    if let Some(error) = session.error() {
        return Err(RemotePlayError::Protocol(error));
    }
    Ok(())
}
