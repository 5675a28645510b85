//! UC2 Controller Probe Tool
//!
//! Connects to a UC2 controller (or falls back to the offline transport),
//! prints the connection state and optionally sends one JSON command.
//!
//! Usage:
//!   cargo run --example uc2_probe -- [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT       Serial port to try first (default: scan all ports)
//!   --baud RATE       Baud rate (default: 115200)
//!   --timeout MS      Response timeout in ms (default: 20000)
//!   --send JSON       Command to send, e.g. '{"task":"/state_get"}'
//!   --responses N     Responses to wait for (default: 1, 0 = fire-and-forget)
//!   --config FILE     Load session settings from a JSON file
//!   --list            List serial ports and exit

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;
use uc2link_core::prelude::*;
use uc2link_core::protocol::list_ports;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = SessionConfig::default();
    let mut command: Option<String> = None;
    let mut responses = 1usize;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    config.port_name = Some(args[i].clone());
                }
            }
            "--baud" | "-b" => {
                i += 1;
                if i < args.len() {
                    config.baud_rate = args[i].parse().unwrap_or(config.baud_rate);
                }
            }
            "--timeout" | "-t" => {
                i += 1;
                if i < args.len() {
                    config.timeout_ms = args[i].parse().unwrap_or(config.timeout_ms);
                }
            }
            "--send" | "-s" => {
                i += 1;
                if i < args.len() {
                    command = Some(args[i].clone());
                }
            }
            "--responses" | "-n" => {
                i += 1;
                if i < args.len() {
                    responses = args[i].parse().unwrap_or(1);
                }
            }
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    let port = config.port_name.take();
                    config = SessionConfig::from_file(&args[i])
                        .with_context(|| format!("loading {}", args[i]))?;
                    if port.is_some() {
                        config.port_name = port;
                    }
                }
            }
            "--list" | "-l" => {
                print_ports(&config.port_filter);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            arg if !arg.starts_with('-') => {
                config.port_name = Some(arg.to_string());
            }
            other => bail!("unknown option: {}", other),
        }
        i += 1;
    }

    println!("uc2link {}", uc2link_core::VERSION);
    let timeout = config.timeout();
    let session = Session::new(config);
    let state = session.connect()?;

    println!("State:        {:?}", state);
    println!(
        "Port:         {}",
        session.port_name().unwrap_or_else(|| "NotConnected".to_string())
    );
    println!(
        "Manufacturer: {}",
        session.manufacturer().unwrap_or_else(|| "unknown".to_string())
    );

    if let Some(text) = command {
        let payload: serde_json::Value =
            serde_json::from_str(&text).context("--send expects a JSON object")?;
        let outcome = session.send(payload, responses, timeout, responses > 0)?;
        match &outcome {
            SendOutcome::Responses { qid, messages } => {
                println!("qid {}: {} response(s)", qid, messages.len());
                for message in messages {
                    println!("  {}", serde_json::to_string_pretty(message.fields())?);
                }
            }
            SendOutcome::Sent { qid } => println!("qid {}: sent", qid),
            SendOutcome::WrongCommand { qid } => println!("qid {}: rejected by device", qid),
            SendOutcome::TimedOut { qid } => {
                println!("qid {}: no response within {:?}", qid, timeout)
            }
            SendOutcome::Abandoned { qid } => println!("qid {}: interrupted", qid),
            SendOutcome::Forwarded => println!("forwarded"),
        }
    }

    if session.reset_requested() {
        println!("Device rebooted during the session");
    }

    session.close();
    Ok(())
}

fn print_ports(filter: &PortFilter) {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }
    for port in ports {
        let mark = if filter.matches(&port) { "*" } else { " " };
        println!("{} {:<24} {}", mark, port.name, port.description());
    }
    println!("(* = scanned during discovery)");
}

fn print_help() {
    println!("UC2 Controller Probe Tool");
    println!();
    println!("Usage: uc2_probe [OPTIONS] [PORT]");
    println!();
    println!("Options:");
    println!("  --port, -p PORT       Serial port to try first (default: scan)");
    println!("  --baud, -b RATE       Baud rate (default: 115200)");
    println!("  --timeout, -t MS      Response timeout in ms (default: 20000)");
    println!("  --send, -s JSON       Command to send");
    println!("  --responses, -n N     Responses to wait for (default: 1)");
    println!("  --config, -c FILE     Load session settings from a JSON file");
    println!("  --list, -l            List serial ports and exit");
    println!("  --help, -h            Show this help");
}
