//! Network reachability

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Current reachability plus a feed of changes
pub trait NetworkInfo: Send + Sync {
    fn network_status(&self) -> NetworkStatus;

    fn subscribe(&self) -> watch::Receiver<NetworkStatus>;
}

/// Reachability pushed in by the host
#[derive(Debug)]
pub struct NetworkMonitor {
    status: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (status, _) = watch::channel(initial);
        Self { status }
    }

    pub fn set_status(&self, status: NetworkStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?status, "network status changed");
            *current = status;
            true
        });
    }
}

impl NetworkInfo for NetworkMonitor {
    fn network_status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }
}
