use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;

use fte_tunnel::config::{Config, Mode, PidFile};
use fte_tunnel::{client, server, Error};

#[derive(Parser)]
#[command(name = "fte-tunnel", about = "Format-transforming encryption tunnel")]
struct Arguments {
    /// Run as the client (application-facing) or server (origin-facing) proxy.
    #[arg(long)]
    mode: String,
    /// Address to accept connections on, host:port.
    #[arg(long)]
    listen: String,
    /// Address to forward to: the server's tunnel port (client mode) or the
    /// origin (server mode), host:port.
    #[arg(long)]
    forward: String,
    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Session key, 64 hex characters; overrides the configured one.
    #[arg(long)]
    key: Option<String>,
}

fn main() -> ExitCode {
    let args = Arguments::parse();

    let mut cfg = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("fte-tunnel: {e:#}");
                return ExitCode::from(1);
            }
        },
        None => Config::default(),
    };
    if let Some(key) = args.key {
        cfg.key = key;
    }
    let mode = match args.mode.as_str() {
        "client" => Mode::Client,
        "server" => Mode::Server,
        other => {
            eprintln!("fte-tunnel: unknown mode {other:?} (want client or server)");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = cfg.validate() {
        eprintln!("fte-tunnel: {e:#}");
        return ExitCode::from(1);
    }

    let _pid_file = match &cfg.pid_dir {
        Some(dir) => match PidFile::write(dir, mode) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("fte-tunnel: {e:#}");
                None
            }
        },
        None => None,
    };

    ExitCode::from(run(mode, &cfg, &args.listen, &args.forward))
}

fn run(mode: Mode, cfg: &Config, listen: &str, forward: &str) -> u8 {
    match mode {
        Mode::Client => {
            let state = match client::start_client(cfg, listen, forward) {
                Ok(state) => state,
                Err(e) => return startup_exit_code(&e),
            };
            while state.is_running() {
                thread::sleep(Duration::from_millis(200));
            }
            match state.take_fatal() {
                Some(Error::NegotiateTimeout) => 3,
                _ => 0,
            }
        }
        Mode::Server => {
            let state = match server::start_server(cfg, listen, forward) {
                Ok(state) => state,
                Err(e) => return startup_exit_code(&e),
            };
            while state.is_running() {
                thread::sleep(Duration::from_millis(200));
            }
            0
        }
    }
}

fn startup_exit_code(e: &anyhow::Error) -> u8 {
    eprintln!("fte-tunnel: {e:#}");
    match e.downcast_ref::<Error>() {
        Some(Error::FailedToBind(_)) => 2,
        _ => 1,
    }
}
