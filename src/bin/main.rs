use clap::{Parser, Subcommand};
use netgauge::{
    Client, ServerConfig, ServerEvent, TestConfig, TestEvent,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "netgauge")]
#[command(about = "iperf3-compatible network bandwidth measurement", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Bind to a specific address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run in client mode
    Client {
        /// Server address to connect to
        server: String,

        /// Port to connect to
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value = "10")]
        time: u64,

        /// Bytes to transfer instead of a duration
        #[arg(short = 'n', long)]
        bytes: Option<u64>,

        /// Target bandwidth in bits per second
        #[arg(short, long)]
        bandwidth: Option<u64>,

        /// Buffer length in bytes
        #[arg(short = 'l', long, default_value = "131072")]
        length: usize,

        /// Number of parallel streams
        #[arg(short = 'P', long, default_value = "1")]
        parallel: usize,

        /// Reverse mode (server sends, client receives)
        #[arg(short = 'R', long)]
        reverse: bool,

        /// Disable Nagle's algorithm
        #[arg(short = 'N', long)]
        no_delay: bool,

        /// Socket buffer (window) size in bytes
        #[arg(short = 'w', long)]
        window: Option<usize>,

        /// Seconds between reports
        #[arg(short, long, default_value = "1")]
        interval: u64,
    },
}

fn format_rate(bits_per_second: f64) -> String {
    if bits_per_second >= 1e9 {
        format!("{:6.2} Gbits/sec", bits_per_second / 1e9)
    } else {
        format!("{:6.2} Mbits/sec", bits_per_second / 1e6)
    }
}

async fn run_server(port: u16, bind: Option<String>) -> anyhow::Result<()> {
    let mut config = ServerConfig::new(port);
    if let Some(addr) = bind {
        config.bind_addr = Some(addr.parse()?);
    }

    let server = netgauge::Server::new();
    let (mut events, handle) = server.start(config)?;

    let stopper = handle.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stopper.stop();
    });

    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Ready { status } => {
                println!("-----------------------------------------------------------");
                println!("Server listening on {}", status.port);
                println!("-----------------------------------------------------------");
            }
            ServerEvent::ClientConnected { addr } => {
                println!("Accepted connection from {}", addr);
            }
            ServerEvent::TestRunning { sample } => {
                println!(
                    "[{:3}] {:5.2}-{:5.2} sec  {}",
                    sample.stream_id,
                    sample.start_secs,
                    sample.end_secs,
                    format_rate(sample.bits_per_second)
                );
            }
            ServerEvent::TestComplete {
                total_bytes,
                duration,
            } => {
                println!(
                    "Test complete: {:.2} MBytes in {:.1} sec",
                    total_bytes as f64 / 1e6,
                    duration.as_secs_f64()
                );
            }
            ServerEvent::SessionError { message } => eprintln!("session error: {}", message),
            ServerEvent::Error { message } => {
                eprintln!("server error: {}", message);
                break;
            }
            ServerEvent::Stopped => break,
            _ => {}
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    server: String,
    port: u16,
    time: u64,
    bytes: Option<u64>,
    bandwidth: Option<u64>,
    length: usize,
    parallel: usize,
    reverse: bool,
    no_delay: bool,
    window: Option<usize>,
    interval: u64,
) -> anyhow::Result<()> {
    let mut config = TestConfig::new(server, port)
        .with_duration(Duration::from_secs(time))
        .with_buffer_len(length)
        .with_streams(parallel)
        .with_reverse(reverse)
        .with_no_delay(no_delay)
        .with_reporting_interval(Duration::from_secs(interval));
    if let Some(n) = bytes {
        config = config.with_bytes_to_transfer(n);
    }
    if let Some(bw) = bandwidth {
        config = config.with_bandwidth(bw);
    }
    if let Some(w) = window {
        config = config.with_window_size(w);
    }

    let client = Client::new();
    let (mut events, handle) = client.start(config)?;

    let canceller = handle.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        canceller.cancel();
    });

    while let Some(event) = events.recv().await {
        match event {
            TestEvent::Connecting { host, port } => {
                println!("Connecting to host {}, port {}", host, port);
            }
            TestEvent::Started { .. } => {
                println!("[ ID] Interval           Transfer     Bitrate");
            }
            TestEvent::Interval { sample, .. } => {
                println!(
                    "[{:3}] {:5.2}-{:5.2} sec  {:6.2} MBytes  {}",
                    sample.stream_id,
                    sample.start_secs,
                    sample.end_secs,
                    sample.bytes as f64 / 1e6,
                    format_rate(sample.bits_per_second)
                );
            }
            TestEvent::Complete { result } => {
                println!("- - - - - - - - - - - - - - - - - - - - - - - - -");
                println!(
                    "[SUM] {:5.2}-{:5.2} sec  {:6.2} MBytes  {}  {}",
                    0.0,
                    result.duration.as_secs_f64(),
                    result.total_bytes as f64 / 1e6,
                    format_rate(result.avg_bandwidth),
                    if result.reverse { "receiver" } else { "sender" }
                );
            }
            TestEvent::Error { message, .. } => {
                anyhow::bail!("test failed: {}", message);
            }
            TestEvent::Cancelled { partial } => {
                match partial {
                    Some(result) => println!(
                        "Cancelled after {:.2} MBytes",
                        result.total_bytes as f64 / 1e6
                    ),
                    None => println!("Cancelled"),
                }
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server { port, bind } => run_server(port, bind).await,
        Commands::Client {
            server,
            port,
            time,
            bytes,
            bandwidth,
            length,
            parallel,
            reverse,
            no_delay,
            window,
            interval,
        } => {
            run_client(
                server, port, time, bytes, bandwidth, length, parallel, reverse, no_delay,
                window, interval,
            )
            .await
        }
    }
}
