use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use log::{error, info, warn};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::spawn;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::device::btle::BtleTransport;
use crate::device::transport::Transport;
use crate::error::AppRunError;
use crate::safety::collaborators::{CommandDispatcher, EmergencyDispatcher, FileLocation, LocationProvider, LogDispatcher, SharedLocation};
use crate::session::Session;
use crate::status::{Notice, StatusBoard};

#[derive(Parser, Debug)]
#[command(version, about = "Companion host for the SmartCane fall detector")]
pub struct Args {
    /// Config file to use instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Fixed address to report in emergency messages
    #[arg(long, conflicts_with = "location_file")]
    pub location: Option<String>,

    /// File whose first line holds the current address, kept up to date by an external locator
    #[arg(long)]
    pub location_file: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,

    /// Do not start looking for the cane on startup
    #[arg(long)]
    pub no_connect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Retry,
    Disconnect,
    Send(Vec<u8>),
    Acknowledge,
    Status,
    Help,
    Quit,
}

const HELP: &str = "Commands: connect, retry, disconnect, send <text>, ack, status, help, quit";

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));

        match command {
            "connect" => Ok(ConsoleCommand::Connect),
            "retry" => Ok(ConsoleCommand::Retry),
            "disconnect" => Ok(ConsoleCommand::Disconnect),
            "send" if !rest.trim().is_empty() => Ok(ConsoleCommand::Send(rest.trim().as_bytes().to_vec())),
            "send" => Err("send needs something to send".to_string()),
            "ack" => Ok(ConsoleCommand::Acknowledge),
            "status" => Ok(ConsoleCommand::Status),
            "help" | "?" => Ok(ConsoleCommand::Help),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            other => Err(format!("Unknown command \"{}\". {}", other, HELP)),
        }
    }
}

fn describe_notice(notice: &Notice) -> String {
    match notice {
        Notice::ConnectionFailed { reason } => format!("Error while connecting, please check the cane ({})", reason),
        Notice::RequestEnableTransport => "Please turn on bluetooth and retry".to_string(),
        Notice::TransportUnsupported => "Bluetooth is not supported on this machine".to_string(),
        Notice::CaneNotFound => "Could not find the cane".to_string(),
        Notice::LinkLost { reason } => format!("Disconnected from the cane ({})", reason),
        Notice::EmergencyDispatched { text } => format!("Emergency message sent: {}", text),
        Notice::DispatchFailed { reason } => format!("EMERGENCY MESSAGE COULD NOT BE SENT: {}", reason),
    }
}

fn print_status(status: &StatusBoard) {
    let snapshot = status.snapshot();
    let connected = match snapshot.connected {
        None => "unknown",
        Some(true) => "connected",
        Some(false) => "disconnected",
    };

    println!("cane: {} | {}", connected, snapshot.progress);
    if snapshot.fall_detected {
        match snapshot.remaining {
            Some(remaining) => println!("cane dropped, emergency message in {}", humantime::format_duration(remaining)),
            None => println!("cane dropped"),
        }
    }
}

fn report_notices(mut notices: broadcast::Receiver<Notice>, cancel: CancellationToken) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                notice = notices.recv() => match notice {
                    Ok(notice) => println!("{}", describe_notice(&notice)),
                    Err(broadcast::error::RecvError::Lagged(_)) => {},
                    Err(broadcast::error::RecvError::Closed) => break 'mainloop,
                },
            }
        }
    })
}

fn spawn_connect<T: Transport>(session: &Session<T>, retry: bool) {
    let supervisor = session.supervisor().clone();
    spawn(async move {
        let result = if retry { supervisor.retry().await } else { supervisor.connect().await };
        if let Ok(handle) = result {
            println!("Connected to {}", handle);
        }
    });
}

/// Returns false when the console should stop.
async fn handle_command<T: Transport>(session: &Session<T>, command: ConsoleCommand) -> bool {
    match command {
        ConsoleCommand::Connect => spawn_connect(session, false),
        ConsoleCommand::Retry => spawn_connect(session, true),
        ConsoleCommand::Disconnect => session.supervisor().disconnect().await,
        ConsoleCommand::Send(bytes) => {
            if let Err(err) = session.link().send(&bytes).await {
                println!("Failed to send: {}", err);
            }
        },
        ConsoleCommand::Acknowledge => session.acknowledge(),
        ConsoleCommand::Status => print_status(session.status()),
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => return false,
    }
    true
}

async fn run_console<T: Transport>(session: &Session<T>) {
    let mut lines = BufReader::new(stdin()).lines();
    println!("{}", HELP);

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return;
            },
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) if line.trim().is_empty() => {},
            Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                Ok(command) => {
                    if !handle_command(session, command).await {
                        return;
                    }
                },
                Err(message) => println!("{}", message),
            },
            Ok(None) => {
                // stdin closed (running as a service): keep monitoring until interrupted
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for ctrl-c: {:?}", err);
                }
                return;
            },
            Err(err) => {
                warn!("Failed to read from stdin: {:?}", err);
                return;
            },
        }
    }
}

fn make_location(args: &Args) -> Arc<dyn LocationProvider> {
    match (&args.location_file, &args.location) {
        (Some(path), _) => Arc::new(FileLocation::new(path)),
        (None, Some(address)) => Arc::new(SharedLocation::new(address.clone())),
        (None, None) => Arc::new(SharedLocation::default()),
    }
}

pub async fn run_application(args: Args) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(args.config.as_deref())?;
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;
    let config = config_io.load_or_init().await?;

    let dispatcher: Arc<dyn EmergencyDispatcher> = match &config.dispatch_command {
        Some(command) => Arc::new(CommandDispatcher::new(
            command,
            config.emergency_contact.clone(),
            config.dispatch_timeout(),
        )?),
        None => {
            warn!("No dispatchCommand configured in {}; emergency messages are only logged", config_io.path().to_string_lossy());
            Arc::new(LogDispatcher::new(config.emergency_contact.clone()))
        },
    };

    let transport = Arc::new(BtleTransport::new(config.scan_timeout()).await?);
    let session = Session::start(&config, transport, make_location(&args), dispatcher);

    let cancel = CancellationToken::new();
    let notices = report_notices(session.status().notices(), cancel.clone());

    if !args.no_connect {
        spawn_connect(&session, false);
    }

    run_console(&session).await;

    session.dispose().await;
    cancel.cancel();
    if let Err(err) = notices.await {
        error!("Notice reporter failed: {:?}", err);
    }
    Ok(())
}
