use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::sync::SyncEngine;

/// Tracks backend reachability and starts a sync whenever it comes back.
///
/// The platform integration calls [`set_reachable`](Self::set_reachable); only an
/// offline to online edge triggers a sync.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    reachable: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_reachable: bool) -> Self {
        let (reachable, _) = watch::channel(initially_reachable);
        Self { reachable }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
    }

    pub fn is_reachable(&self) -> bool {
        *self.reachable.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.reachable.subscribe()
    }

    /// Keeps `engine`'s online flag in step with reachability for as long as this monitor lives.
    pub fn spawn(&self, engine: SyncEngine) -> JoinHandle<()> {
        let mut receiver = self.reachable.subscribe();
        let mut online = *receiver.borrow_and_update();
        engine.set_online(online);

        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let now_online = *receiver.borrow_and_update();
                engine.set_online(now_online);

                if now_online && !online {
                    tracing::info!("Connectivity restored, starting sync");
                    match engine.perform_full_sync().await {
                        Ok(Some(_)) => {}
                        Ok(None) => tracing::debug!("Sync on reconnect was skipped"),
                        Err(e) => tracing::warn!("Sync on reconnect failed: {:#}", e),
                    }
                } else if !now_online && online {
                    tracing::info!("Connectivity lost");
                }
                online = now_online;
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
