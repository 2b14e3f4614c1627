use tokio::sync::broadcast;

/// Abstract system events that affect connection liveness. Concrete
/// sources (logind sleep signals, a network monitor, a test harness) feed
/// a [`SystemSignals`] hub; the controller only consumes the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemSignal {
    /// The host is about to sleep; the session should be suspended.
    Sleeping,
    /// The host woke up; a suspended session may reconnect.
    Woke,
    /// Network connectivity changed; worth probing the session.
    ConnectivityChanged,
}

pub trait SignalSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<SystemSignal>;
}

/// Broadcast-backed signal hub. Dropping a receiver unsubscribes it;
/// notifications sent with no listeners are discarded.
pub struct SystemSignals {
    tx: broadcast::Sender<SystemSignal>,
}

impl SystemSignals {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn notify(&self, signal: SystemSignal) {
        let _ = self.tx.send(signal);
    }
}

impl Default for SystemSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSource for SystemSignals {
    fn subscribe(&self) -> broadcast::Receiver<SystemSignal> {
        self.tx.subscribe()
    }
}
