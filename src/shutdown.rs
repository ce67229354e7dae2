//! Teardown signal shared by the session loop and every attempt task.

use std::sync::Arc;
use tokio::sync::watch;

/// Fires once; every [`Shutdown`] clone observes it.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    /// A signal that never fires.
    pub fn never() -> Shutdown {
        let (tx, rx) = watch::channel(false);
        // Sender dropped: `cancelled` parks forever
        drop(tx);
        Shutdown { rx }
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires. Parks forever if the trigger is gone
    /// without firing.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_fire_wakes_every_subscriber() {
        let (trigger, shutdown) = channel();
        let mut a = shutdown.clone();
        let mut b = trigger.subscribe();

        let waiter = tokio::spawn(async move { b.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        trigger.fire();
        a.cancelled().await;
        waiter.await.unwrap();
        assert!(shutdown.is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_fired_resolves_immediately() {
        let (trigger, mut shutdown) = channel();
        trigger.fire();
        shutdown.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_does_not_resolve() {
        let mut shutdown = Shutdown::never();
        let res = tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled()).await;
        assert!(res.is_err());
        assert!(!shutdown.is_fired());
    }
}
