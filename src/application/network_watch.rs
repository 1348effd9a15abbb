//! Feed interface-change notifications into IP-change cycles

use super::context::AppContext;
use crate::domain::shared::ReachError;
use futures::stream::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A local address or interface change reported by the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkChange {
    /// Interface that changed, when known
    pub interface: Option<String>,
}

impl AppContext {
    /// Start one IP-change cycle per event, with the configured parameters.
    ///
    /// Events arriving while a cycle runs are logged and dropped. The
    /// watcher ends with the stream.
    pub fn spawn_network_watcher<S>(&self, changes: S) -> JoinHandle<()>
    where
        S: Stream<Item = NetworkChange> + Send + 'static,
    {
        let core = self.core.clone();
        self.core.handle.spawn(async move {
            let mut changes = Box::pin(changes);
            while let Some(change) = changes.next().await {
                let param = core.config.ip_change.param();
                match core.handle_ip_change(param) {
                    Ok(cycle) => info!(
                        %cycle,
                        "Network change on {}",
                        change.interface.as_deref().unwrap_or("unknown interface")
                    ),
                    Err(ReachError::Busy(reason)) => warn!("Network change ignored: {}", reason),
                    Err(e) => warn!("Network change not handled: {}", e),
                }
            }
            info!("Network watcher stopped");
        })
    }
}
