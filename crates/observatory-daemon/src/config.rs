//! Command line and environment configuration.
//!
//! Every option can also come from an `OBSERVATORY_*` variable; a `.env` file in
//! the working directory is loaded before parsing.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use observatory::{CorrelationMode, EngineConfig, HubConfig, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "observatory", version, about = "Socket hub and device engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the hub socket and run the engine.
    Hub(HubArgs),
    /// Run the engine on stdin/stdout (spawned by `hub`).
    #[command(hide = true)]
    Engine(EngineArgs),
    /// Send one request to a running hub and print the reply.
    Send(SendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    #[arg(long, env = "OBSERVATORY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "OBSERVATORY_PORT", default_value_t = 52902)]
    pub port: u16,

    /// Seconds a synced request waits for the engine
    #[arg(long, env = "OBSERVATORY_TIMEOUT", default_value = "5", value_parser = parse_seconds)]
    pub timeout: Duration,

    /// Seconds between polls while waiting
    #[arg(long, env = "OBSERVATORY_CPU_DELAY", default_value = "0.01", value_parser = parse_seconds)]
    pub cpu_delay: Duration,

    /// What to do with responses nobody is waiting for (discard|keyed)
    #[arg(long, env = "OBSERVATORY_CORRELATION", default_value = "discard")]
    pub correlation: CorrelationMode,

    /// Run the engine inside the hub process instead of a child process
    #[arg(long, env = "OBSERVATORY_IN_PROCESS")]
    pub in_process: bool,

    /// Seconds the engine process may take to report ready
    #[arg(long, env = "OBSERVATORY_READY_TIMEOUT", default_value = "30", value_parser = parse_seconds)]
    pub ready_timeout: Duration,

    #[command(flatten)]
    pub engine: EngineArgs,
}

impl HubArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig::default()
            .with_timeout(self.timeout)
            .with_cpu_delay(self.cpu_delay)
            .with_correlation(self.correlation)
    }
}

#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Seconds between engine passes
    #[arg(long, env = "OBSERVATORY_HEARTBEAT", default_value = "0.1", value_parser = parse_seconds)]
    pub heartbeat: Duration,

    /// Room stamped on saved measurements
    #[arg(long, env = "OBSERVATORY_ROOM_ID", default_value = "room_01")]
    pub room_id: String,

    /// Where captured photos are written
    #[arg(long, env = "OBSERVATORY_ASSET_DIR", default_value = ".")]
    pub asset_dir: PathBuf,

    /// Capture command, `{path}` is replaced by the output file
    /// (e.g. "libcamera-still -n -o {path}")
    #[arg(long, env = "OBSERVATORY_CAPTURE_COMMAND")]
    pub capture_command: Option<String>,

    /// Seconds between frames of one capture
    #[arg(long, env = "OBSERVATORY_FRAME_INTERVAL", default_value = "0.1", value_parser = parse_seconds)]
    pub frame_interval: Duration,

    /// Seconds the camera gets to adjust before the first frame
    #[arg(long, env = "OBSERVATORY_WARMUP", default_value = "2", value_parser = parse_seconds)]
    pub warmup: Duration,

    /// SQLite database for measurements [default: .<room-id>.db]
    #[arg(long, env = "OBSERVATORY_STORE_PATH")]
    pub store_path: Option<PathBuf>,
}

impl EngineArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default().with_heartbeat(self.heartbeat)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!(".{}.db", self.room_id)))
    }

    /// Render back into `engine` subcommand arguments for the child process.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "engine".into(),
            "--heartbeat".into(),
            self.heartbeat.as_secs_f64().to_string().into(),
            "--room-id".into(),
            self.room_id.clone().into(),
            "--asset-dir".into(),
            self.asset_dir.clone().into(),
            "--frame-interval".into(),
            self.frame_interval.as_secs_f64().to_string().into(),
            "--warmup".into(),
            self.warmup.as_secs_f64().to_string().into(),
        ];
        if let Some(command) = &self.capture_command {
            args.push("--capture-command".into());
            args.push(command.clone().into());
        }
        if let Some(path) = &self.store_path {
            args.push("--store-path".into());
            args.push(path.clone().into());
        }
        args
    }
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Command name
    pub command: String,

    /// JSON payload
    #[arg(long, default_value = "null")]
    pub payload: String,

    /// Wait for the engine's answer instead of an acknowledgement
    #[arg(long)]
    pub synced: bool,

    #[arg(long, env = "OBSERVATORY_ADDR", default_value = "127.0.0.1:52902")]
    pub addr: String,
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("invalid number of seconds '{s}': {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{s}': {e}"))
}

/// Load `.env` if present. Variables already set win.
///
/// Runs before logging is set up (it may configure logging), so the caller
/// reports the outcome.
pub fn load_dotenv() -> Result<Option<PathBuf>, dotenvy::Error> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("observatory").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn hub_defaults() {
        let Command::Hub(args) = parse(&["hub"]).command else {
            panic!("expected hub");
        };
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.port, 52902);
        assert_eq!(args.timeout, Duration::from_secs(5));
        assert_eq!(args.cpu_delay, Duration::from_millis(10));
        assert_eq!(args.correlation, CorrelationMode::Discard);
        assert!(!args.in_process);
        assert_eq!(args.ready_timeout, Duration::from_secs(30));
        assert_eq!(args.engine.heartbeat, Duration::from_millis(100));
        assert_eq!(args.engine.warmup, Duration::from_secs(2));
        assert_eq!(args.engine.store_path(), PathBuf::from(".room_01.db"));
    }

    #[test]
    fn hub_options_map_to_config() {
        let Command::Hub(args) = parse(&[
            "hub",
            "--timeout",
            "1.5",
            "--cpu-delay",
            "0.05",
            "--correlation",
            "keyed",
        ])
        .command
        else {
            panic!("expected hub");
        };
        let config = args.hub_config();
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.cpu_delay, Duration::from_millis(50));
        assert_eq!(config.correlation, CorrelationMode::Keyed);
    }

    #[test]
    fn negative_seconds_are_rejected() {
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
        assert_eq!(parse_seconds(" 0.25 "), Ok(Duration::from_millis(250)));
    }

    #[test]
    fn engine_args_round_trip_through_child_command_line() {
        let Command::Hub(hub) = parse(&[
            "hub",
            "--room-id",
            "attic",
            "--heartbeat",
            "0.5",
            "--capture-command",
            "libcamera-still -n -o {path}",
        ])
        .command
        else {
            panic!("expected hub");
        };

        let child_args: Vec<String> = hub
            .engine
            .to_args()
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        let refs: Vec<&str> = child_args.iter().map(String::as_str).collect();
        let Command::Engine(engine) = parse(&refs).command else {
            panic!("expected engine");
        };

        assert_eq!(engine.room_id, "attic");
        assert_eq!(engine.heartbeat, Duration::from_millis(500));
        assert_eq!(
            engine.capture_command.as_deref(),
            Some("libcamera-still -n -o {path}")
        );
        assert_eq!(engine.store_path(), PathBuf::from(".attic.db"));
    }

    #[test]
    fn send_parses_command_and_flags() {
        let Command::Send(send) = parse(&["send", "ping", "--synced", "--payload", "\"x\""]).command
        else {
            panic!("expected send");
        };
        assert_eq!(send.command, "ping");
        assert!(send.synced);
        assert_eq!(send.payload, "\"x\"");
    }
}
