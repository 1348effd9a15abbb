use sipreach::application::{AppContext, NetworkChange};
use sipreach::config::Config;
use sipreach::domain::ip_change::IpChangeProgress;
use sipreach::domain::stun::{ResolveStatus, StunResolveResult};
use sipreach::domain::transport::TransportKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting sipreach");

    // Optional config file as first argument, SIPREACH__* variables on top
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    info!("Configuration loaded: {:?}", config);

    let ctx = AppContext::builder(config)
        .on_stun_resolved(Arc::new(|result: &StunResolveResult| match (&result.status, result.addr) {
            (Ok(()), Some(addr)) => info!("Public address {} (via {:?})", addr, result.name),
            (Ok(()), None) => info!("No STUN servers, using local addresses"),
            (Err(e), _) => warn!("STUN resolution failed: {}", e),
        }))
        .on_ip_change(Arc::new(|progress: &IpChangeProgress| {
            info!(
                "IP change {}: {} {:?} {:?}",
                progress.cycle,
                progress.op.as_str(),
                progress.status,
                progress.info
            );
        }))
        .init()?;

    if let ResolveStatus::Done(Err(e)) = ctx.resolve_stun(true, false)? {
        warn!("Continuing without a public address: {}", e);
    }

    let udp = ctx.block_on(ctx.create_transport(TransportKind::Udp, "0.0.0.0:5060".parse()?))??;
    let tcp = ctx.block_on(ctx.create_transport(TransportKind::Tcp, "0.0.0.0:5060".parse()?))??;
    for id in [udp, tcp] {
        if let Some(slot) = ctx.transport_slot(id) {
            info!("{} listening on {}, published as {}", id, slot.local_addr, slot.published_addr);
        }
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        // SIGHUP stands in for an interface-change notification
        let hangups = ctx.block_on(async { signal(SignalKind::hangup()) })??;
        let changes = futures::stream::unfold(hangups, |mut hangups| async move {
            hangups.recv().await.map(|()| (NetworkChange::default(), hangups))
        });
        ctx.spawn_network_watcher(changes);
        info!("Send SIGHUP to simulate an IP address change");
    }

    info!("Press Ctrl+C to stop");
    ctx.block_on(tokio::signal::ctrl_c())??;

    info!("Shutting down");
    ctx.destroy();
    Ok(())
}
