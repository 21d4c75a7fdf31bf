use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::cli::ProbeArgs;
use crate::protocol::{events, Envelope};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the `register` frame the probe announces itself with.
pub fn registration(args: &ProbeArgs) -> Envelope {
    if args.agent {
        Envelope::new(
            events::REGISTER,
            json!({
                "role": "agent",
                "code": args.code,
                "info": {
                    "hostname": args.hostname,
                    "username": "probe",
                    "platform": std::env::consts::OS,
                }
            }),
        )
    } else {
        Envelope::new(
            events::REGISTER,
            json!({ "role": "controller", "info": { "name": "beach-pier-probe" } }),
        )
    }
}

/// Connects, registers, and prints every inbound envelope until the duration elapses
/// or the relay closes the socket.
pub async fn run_probe(args: ProbeArgs) -> Result<()> {
    debug!(url = %args.url, "connecting to relay");
    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(args.url.as_str())).await {
        Ok(result) => result.with_context(|| format!("failed to connect to {}", args.url))?,
        Err(_) => return Err(anyhow!("connection to {} timed out", args.url)),
    };
    let (mut write, mut read) = ws_stream.split();

    let hello = serde_json::to_string(&registration(&args))?;
    write.send(Message::Text(hello.into())).await?;
    info!(url = %args.url, agent = args.agent, "registered; listening");

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    loop {
        let frame = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(frame)) => frame.context("websocket read failed")?,
            Ok(None) => {
                info!("relay closed the connection");
                break;
            }
            Err(_) => break,
        };
        match frame {
            Message::Text(text) => print_frame(text.as_str()),
            Message::Close(_) => {
                info!("relay closed the connection");
                break;
            }
            _ => {}
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

fn print_frame(text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{text}"),
        },
        Err(err) => warn!(error = %err, "relay sent a non-JSON frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use crate::protocol::Registration;
    use clap::Parser;

    fn probe_args(argv: &[&str]) -> ProbeArgs {
        let mut full = vec!["beach-pier", "probe"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Some(Commands::Probe(args)) => args,
            other => panic!("expected probe, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn controller_registration_is_default() {
        let envelope = registration(&probe_args(&[]));
        let parsed: Registration = serde_json::from_value(envelope.data).unwrap();
        assert!(matches!(parsed, Registration::Controller { .. }));
    }

    #[test_timeout::timeout]
    fn agent_registration_carries_code() {
        let envelope = registration(&probe_args(&["--agent", "--code", "654321"]));
        match serde_json::from_value::<Registration>(envelope.data).unwrap() {
            Registration::Agent { code, info } => {
                assert_eq!(code.as_deref(), Some("654321"));
                assert_eq!(info.hostname, "beach-pier-probe");
            }
            other => panic!("expected agent registration, got {other:?}"),
        }
    }
}
