//! beamline - command-line event tracker
//!
//! Sends tracking events through the beamline pipeline from the shell,
//! mainly for smoke-testing an endpoint or a configuration:
//!
//! ```text
//! beamline --api-key KEY --uid USER track level_up level=7
//! ```
//!
//! Events are persisted locally before delivery; the command waits for the
//! queue to drain (bounded by --wait) so a successful exit means the event
//! actually reached the endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use beamline_core::{Identity, Tracker, TrackerConfig};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

#[derive(Parser)]
#[command(name = "beamline")]
#[command(about = "Send tracking events to a collection endpoint")]
#[command(version)]
struct Args {
    /// API key to track against
    #[arg(long)]
    api_key: String,

    /// User id to track against
    #[arg(long)]
    uid: String,

    /// Send to the debug/test endpoint host
    #[arg(long)]
    debug: bool,

    /// Seconds to wait for the queue to drain before giving up
    #[arg(long, default_value_t = 60)]
    wait: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track a single event
    Track {
        /// Event type name
        event_type: String,

        /// Event parameters as key=value pairs
        #[arg(value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },

    /// Track a load event with automatic platform parameters
    Load,

    /// Track a revenue event
    Revenue {
        /// Revenue amount
        total: f64,

        /// Three-letter ISO-4217 currency code
        currency_code: String,
    },

    /// Fetch content for a channel and print it as JSON
    Channel {
        /// Channel id
        channel_id: u32,
    },

    /// Show how many events are queued for delivery
    Status,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

/// Build a parameter map, keeping numeric/boolean values typed.
fn to_parameters(pairs: &[(String, String)]) -> Map<String, Value> {
    let mut parameters = Map::new();
    for (key, value) in pairs {
        let parsed = match serde_json::from_str::<Value>(value) {
            Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
            _ => Value::from(value.as_str()),
        };
        parameters.insert(key.clone(), parsed);
    }
    parameters
}

/// Wait until every queued event has been delivered or discarded.
async fn drain(tracker: &Tracker, wait_secs: u64) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
    loop {
        let pending = tracker.pending().context("failed to read queue depth")?;
        if pending == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "timed out after {}s with {} event(s) still queued; they will be \
                 delivered on the next run",
                wait_secs,
                pending
            );
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TrackerConfig::load().context("failed to load configuration")?;
    let _log_guard =
        beamline_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let tracker = Tracker::new(config).context("failed to create tracker")?;
    let identity = Identity::single(&args.api_key, &args.uid)?;
    tracker
        .init(identity, args.debug)
        .context("failed to initialize tracker")?;
    tracing::info!(debug = args.debug, "Tracker initialized");

    match args.command {
        Command::Track { event_type, params } => {
            tracker.track(&event_type, Some(to_parameters(&params)))?;
            drain(&tracker, args.wait).await?;
            println!("delivered: {}", event_type);
        }
        Command::Load => {
            tracker.track_load(None)?;
            drain(&tracker, args.wait).await?;
            println!("delivered: load event");
        }
        Command::Revenue {
            total,
            currency_code,
        } => {
            tracker.track_revenue(total, &currency_code, None)?;
            drain(&tracker, args.wait).await?;
            println!("delivered: revenue event ({} {})", total, currency_code);
        }
        Command::Channel { channel_id } => {
            let content = tracker.channel(channel_id).await?;
            println!("{}", serde_json::to_string_pretty(&content)?);
        }
        Command::Status => {
            println!("pending events: {}", tracker.pending()?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("level=7").unwrap(),
            ("level".to_string(), "7".to_string())
        );
        assert!(parse_key_value("no-separator").is_err());
    }

    #[test]
    fn test_to_parameters_keeps_scalars_typed() {
        let pairs = vec![
            ("level".to_string(), "7".to_string()),
            ("vip".to_string(), "true".to_string()),
            ("name".to_string(), "gold pack".to_string()),
        ];
        let parameters = to_parameters(&pairs);
        assert_eq!(parameters.get("level"), Some(&Value::from(7)));
        assert_eq!(parameters.get("vip"), Some(&Value::from(true)));
        assert_eq!(parameters.get("name"), Some(&Value::from("gold pack")));
    }
}
