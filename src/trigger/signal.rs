//! SIGUSR1 as a reset request

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use super::ResetTrigger;
use crate::error::Result;

/// Latches SIGUSR1 deliveries until polled
pub struct SignalTrigger {
    pending: Arc<AtomicBool>,
}

impl SignalTrigger {
    /// Register the handler; must run inside a tokio runtime
    pub fn install() -> Result<Self> {
        let mut stream = signal(SignalKind::user_defined1())?;
        let pending = Arc::new(AtomicBool::new(false));

        let flag = pending.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                info!("SIGUSR1 received, restart requested");
                flag.store(true, Ordering::SeqCst);
            }
            warn!("SIGUSR1 stream closed");
        });

        Ok(Self { pending })
    }
}

impl ResetTrigger for SignalTrigger {
    fn poll(&mut self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "signal"
    }
}
