// Bandlink: send text files to a wearable peer over the envelope protocol.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use bandlink_cli::{
    config, measure, EnvelopeChannel, FnObserver, FsSource, Session, TransferHandle, UdpChannel,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: bandlink send <path> | bandlink --version";

/// How long a cancel gets to reach the peer before the process exits.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let path = match args.next().as_deref() {
        Some("--version") | Some("-V") => {
            println!("bandlink {}", VERSION);
            return Ok(());
        }
        Some("send") => args.next().map(PathBuf::from).ok_or_else(|| anyhow!(USAGE))?,
        _ => bail!(USAGE),
    };

    let (cfg, cfg_err) = config::load();
    init_logging(&cfg.log_level);
    if let Some(e) = cfg_err {
        warn!(error = %e, "ignoring config file, using defaults");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(send(cfg, path))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn send(cfg: config::Config, path: PathBuf) -> anyhow::Result<()> {
    let offer = measure(&path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;

    let udp = UdpChannel::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", cfg.bind_addr))?;
    udp.add_peer(&cfg.peer_id, cfg.peer_addr);
    let inbound = udp.subscribe(&cfg.peer_id)?;
    let channel = Arc::new(EnvelopeChannel::new(cfg.peer_id.clone(), udp));
    let session = Session::start(channel, cfg.handshake_config(), inbound)?;
    let transfer =
        TransferHandle::spawn(session, Arc::new(FsSource::new()), cfg.transfer_config())?;

    info!(peer = %cfg.peer_id, addr = %cfg.peer_addr, file = %offer.filename, "sending");
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let failed_tx = done_tx.clone();
    transfer.send_file(
        offer,
        FnObserver::new(
            |progress, status: &str| println!("{} {:.2}%", status, progress * 100.0),
            move |message: &str, _count| {
                let _ = done_tx.send(Ok(message.to_string()));
            },
            move |message: &str, _count| {
                let _ = failed_tx.send(Err(message.to_string()));
            },
        ),
    )?;

    tokio::select! {
        outcome = done_rx.recv() => match outcome {
            Some(Ok(message)) => {
                println!("transfer succeeded: {}", message);
                Ok(())
            }
            Some(Err(message)) => bail!("transfer failed: {}", message),
            None => bail!("transfer stopped without an outcome"),
        },
        _ = tokio::signal::ctrl_c() => {
            transfer.cancel();
            tokio::time::sleep(CANCEL_GRACE).await;
            println!("transfer cancelled");
            Ok(())
        }
    }
}
