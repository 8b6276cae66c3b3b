use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Create a linked trigger/token pair.
///
/// The token side is cloned into every worker. Cancelling the trigger sets
/// the termination flag and drops the only sender of the signal channel,
/// which wakes every blocking `recv_timeout` and every pending
/// `recv_async` at once.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownToken) {
    let terminate = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = flume::bounded::<()>(1);
    let token = ShutdownToken {
        terminate: Arc::clone(&terminate),
        signal: receiver,
    };
    let trigger = ShutdownTrigger {
        terminate,
        signal: Some(sender),
        token: token.clone(),
    };
    (trigger, token)
}

/// Owner side of the shutdown signal, held by the lifecycle manager.
pub struct ShutdownTrigger {
    terminate: Arc<AtomicBool>,
    signal: Option<flume::Sender<()>>,
    token: ShutdownToken,
}

impl ShutdownTrigger {
    /// Request termination. Idempotent.
    pub fn cancel(&mut self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.signal.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }
}

/// Worker side of the shutdown signal.
#[derive(Clone)]
pub struct ShutdownToken {
    terminate: Arc<AtomicBool>,
    signal: flume::Receiver<()>,
}

impl std::fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Block the calling thread for up to `timeout`.
    ///
    /// Returns `true` as soon as termination is requested, `false` when the
    /// full timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.signal.recv_timeout(timeout) {
            Err(flume::RecvTimeoutError::Disconnected) => true,
            _ => self.is_cancelled(),
        }
    }

    /// Resolve once termination is requested.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // Nothing is ever sent: this only returns on disconnection.
        let _ = self.signal.recv_async().await;
    }

    /// Async counterpart of [`wait_timeout`](Self::wait_timeout).
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn wait_times_out_while_running() {
        let (_trigger, token) = shutdown_channel();
        let started = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_wakes_blocked_waiter() {
        let (mut trigger, token) = shutdown_channel();
        let waiter = std::thread::spawn(move || {
            let started = Instant::now();
            let cancelled = token.wait_timeout(Duration::from_secs(10));
            (cancelled, started.elapsed())
        });

        std::thread::sleep(Duration::from_millis(50));
        trigger.cancel();
        let (cancelled, waited) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn cancel_is_idempotent_and_visible_to_clones() {
        let (mut trigger, token) = shutdown_channel();
        let clone = trigger.token();
        trigger.cancel();
        trigger.cancel();
        assert!(trigger.is_cancelled());
        assert!(token.is_cancelled());
        assert!(clone.wait_timeout(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn async_sleep_is_interrupted() {
        let (mut trigger, token) = shutdown_channel();
        let sleeper = tokio::spawn(async move { token.sleep(Duration::from_secs(10)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
        assert!(sleeper.await.unwrap());
    }
}
