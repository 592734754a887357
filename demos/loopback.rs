use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use tokio::time::Instant;
use tracing::{info, Level};

use slap::config::SlapConfig;
use slap::loopback::LoopbackPair;
use slap::raw_link::memory_link::LinkImpairment;

/// Transfers data between two SLAP streams over a simulated noisy serial line
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = 100_000)]
    num_bytes: usize,

    #[clap(long, default_value_t = 100)]
    packet_size: u16,

    #[clap(long, default_value_t = 4)]
    window_size: u8,

    /// probability that a chunk written to the line is lost
    #[clap(long, default_value_t = 0.02)]
    drop: f64,

    /// probability that a byte in a chunk written to the line is garbled
    #[clap(long, default_value_t = 0.02)]
    corrupt: f64,

    /// probability that a chunk written to the line arrives twice
    #[clap(long, default_value_t = 0.0)]
    duplicate: f64,

    /// probability that a chunk written to the line overtakes the next one
    #[clap(long, default_value_t = 0.0)]
    reorder: f64,

    #[clap(long, default_value_t = 1)]
    seed: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let config = SlapConfig {
        packet_size: args.packet_size,
        window_size: args.window_size,
        max_retries: 50,
        ..SlapConfig::default()
    };
    let impairment = LinkImpairment {
        drop_probability: args.drop,
        corrupt_probability: args.corrupt,
        duplicate_probability: args.duplicate,
        reorder_probability: args.reorder,
        seed: args.seed,
    };
    let pair = LoopbackPair::new(config.clone(), config, 4096, impairment)?;

    let params = pair.a.wait_negotiated(Duration::from_secs(10)).await?;
    info!("negotiated {:?}", params);

    let data: Vec<u8> = (0..args.num_bytes).map(|i| (i % 251) as u8).collect();
    let start = Instant::now();

    let sender = pair.a.clone();
    let to_send = data.clone();
    let send_task = tokio::spawn(async move {
        let mut offs = 0;
        while offs < to_send.len() {
            sender.wait_writable(Duration::from_secs(30)).await?;
            offs += sender.push(&to_send[offs..])?;
        }
        anyhow::Ok(())
    });

    let mut received = Vec::with_capacity(data.len());
    let mut buf = vec![0u8; 4096];
    while received.len() < data.len() {
        let n = pair.b.pull(&mut buf, Duration::from_secs(30)).await?;
        received.extend_from_slice(&buf[..n]);
    }
    send_task.await??;

    let elapsed = start.elapsed();
    if received != data {
        anyhow::bail!("received data differs from sent data");
    }
    info!("transferred {} bytes in {:?} ({:.0} bytes/s)", received.len(), elapsed, received.len() as f64 / elapsed.as_secs_f64());

    pair.shutdown().await
}
