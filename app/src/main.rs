// borip command-line tool -- serve simulated receivers, or probe a remote
// BorIP server and report what arrives over UDP.
//
// Usage:
//   borip serve
//   borip serve --port 28888 --device "sim rate=1e6" --lock
//   borip serve --default rtl --log-commands
//   borip probe radio.lan --which rtl --freq 100e6 --gain 20 --duration 10
//   borip probe 10.0.0.2:9000 --rate 250000 --reconnect -1

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use borip::client::{BoripClient, ClientEvent, ClientOptions};
use borip::server::{BoripServer, ServerOptions};
use borip::{Device, NetworkTransport, TuneStatus};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// BorIP -- remote software-defined receivers over TCP and UDP.
#[derive(Parser)]
#[command(name = "borip", version, about)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server with the simulated backends until Ctrl-C.
    Serve {
        /// Interface to bind.
        #[arg(long, default_value = "0.0.0.0")]
        listen: String,

        /// TCP control port.
        #[arg(long, default_value_t = 28888)]
        port: u16,

        /// Default UDP destination port (defaults to the control port).
        #[arg(long)]
        data_port: Option<u16>,

        /// Device hint, e.g. "rtl" or "sim rate=1e6".
        #[arg(long)]
        device: Option<String>,

        /// Module used when a client's hint is empty.
        #[arg(long = "default")]
        default_module: Option<String>,

        /// Share one device between all clients and ignore DEVICE requests.
        #[arg(long)]
        lock: bool,

        /// Log every command and response.
        #[arg(long)]
        log_commands: bool,
    },

    /// Connect to a server, tune, stream, and report packet counts.
    Probe {
        /// Server address as host[:port], or "-" to only listen for UDP.
        address: String,

        /// Device hint sent to the server.
        #[arg(long)]
        which: Option<String>,

        /// Centre frequency in Hz.
        #[arg(long)]
        freq: Option<f64>,

        /// Gain in dB.
        #[arg(long)]
        gain: Option<f64>,

        /// Sample rate in samples per second.
        #[arg(long)]
        rate: Option<f64>,

        /// Seconds to stream (0 = until Ctrl-C).
        #[arg(long, default_value_t = 5)]
        duration: u64,

        /// Local UDP port (defaults to the control port).
        #[arg(long)]
        udp_port: Option<u16>,

        /// Reconnect budget: -1 forever, 0 never, n at most n times.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        reconnect: i32,
    },
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ---------------------------------------------------------------------------
// Serve
// ---------------------------------------------------------------------------

async fn cmd_serve(
    listen: String,
    port: u16,
    data_port: Option<u16>,
    device: Option<String>,
    default_module: Option<String>,
    lock: bool,
    log_commands: bool,
) -> Result<()> {
    let data_port = data_port.unwrap_or(port);
    let mut options = ServerOptions::new()
        .bind_host(&listen)
        .listen_port(port)
        .data_port(data_port)
        .lock(lock)
        .log_commands(log_commands);
    if let Some(hint) = &device {
        options = options.device_hint(hint);
    }
    if let Some(module) = &default_module {
        options = options.default_module(module);
    }

    let registry = borip::default_registry(data_port);
    println!("Modules: {}", registry.modules().join(", "));

    let mut server = BoripServer::new(options, registry);
    let addr = server.start().await.context("failed to start server")?;
    println!("Listening on {addr} (Ctrl-C to stop)");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    println!("Shutting down ({} client(s) connected)", server.client_count());
    server.stop().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

struct ProbeArgs {
    address: String,
    which: Option<String>,
    freq: Option<f64>,
    gain: Option<f64>,
    rate: Option<f64>,
    duration: u64,
    udp_port: Option<u16>,
    reconnect: i32,
}

async fn cmd_probe(args: ProbeArgs) -> Result<()> {
    let mut options = ClientOptions::new().reconnect_attempts(args.reconnect);
    if let Some(which) = &args.which {
        options = options.which(which);
    }
    if let Some(rate) = args.rate {
        options = options.sample_rate(rate);
    }
    if let Some(port) = args.udp_port {
        options = options.udp_port(port);
    }

    let client = BoripClient::connect_to(&args.address, options)
        .await
        .with_context(|| format!("failed to connect to {}", args.address))?;
    let mut events = client.subscribe();

    if let Some(desc) = client.descriptor() {
        println!("Device:      {} (serial {})", desc.name, desc.serial);
        println!(
            "Gain range:  {} to {} dB, step {}",
            desc.gain_range.start, desc.gain_range.stop, desc.gain_range.step
        );
        println!("Clock:       {} Hz", desc.master_clock);
        println!("Antennas:    {}", desc.antennas.join(", "));
    } else if client.is_listen_only() {
        println!("Listen-only, expecting {} byte payloads", client.packet_size());
    }

    if !client.is_listen_only() {
        if let Some(freq) = args.freq {
            match client.set_freq(freq).await? {
                Some(tune) => {
                    let status = match client.was_tune_successful() {
                        TuneStatus::Ok => "",
                        _ => " (out of range)",
                    };
                    println!("Tuned:       {} Hz{status}", tune.actual_rf_freq);
                }
                None => println!("Tune to {freq} Hz refused: {}", last_error(&client)),
            }
        }
        if let Some(gain) = args.gain {
            if !client.set_gain(gain).await? {
                println!("Gain {gain} dB refused: {}", last_error(&client));
            }
        }
        println!("Rate:        {} S/s", client.sample_rate().await?);
        println!("Header:      {}", client.header().await?);
    }

    let Some(mut samples) = client.take_samples() else {
        bail!("sample stream is not available");
    };

    println!("Streaming (Ctrl-C to stop)...");
    let started = Instant::now();
    let deadline = (args.duration > 0).then(|| started + Duration::from_secs(args.duration));

    loop {
        let timeout = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        tokio::select! {
            payload = tokio::time::timeout(timeout, samples.recv()) => match payload {
                Ok(Some(_)) => {}
                Ok(None) => {
                    println!("End of stream.");
                    break;
                }
                Err(_) => {
                    if deadline.is_some() {
                        break;
                    }
                }
            },
            event = events.recv() => {
                if let Ok(event) = event {
                    match event {
                        ClientEvent::Reconnecting { attempt } => println!("[event] reconnecting, attempt {attempt}"),
                        other => println!("[event] {other:?}"),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    if let Some(source) = client.source() {
        let stats = source.stats();
        println!(
            "Received {} packets, {} bytes in {:.1}s ({} dropped)",
            stats.packets(),
            stats.bytes(),
            elapsed,
            stats.dropped()
        );
        if elapsed > 0.0 {
            println!("Throughput:  {:.0} bytes/s", stats.bytes() as f64 / elapsed);
        }
    }

    client.destroy().await;
    Ok(())
}

fn last_error(client: &BoripClient) -> String {
    client
        .last_error()
        .unwrap_or_else(|| "no reason given".to_string())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Serve {
            listen,
            port,
            data_port,
            device,
            default_module,
            lock,
            log_commands,
        } => {
            cmd_serve(
                listen,
                port,
                data_port,
                device,
                default_module,
                lock,
                log_commands,
            )
            .await
        }
        Command::Probe {
            address,
            which,
            freq,
            gain,
            rate,
            duration,
            udp_port,
            reconnect,
        } => {
            cmd_probe(ProbeArgs {
                address,
                which,
                freq,
                gain,
                rate,
                duration,
                udp_port,
                reconnect,
            })
            .await
        }
    }
}
