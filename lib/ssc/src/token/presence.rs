//! Out-of-band token presence observer

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::{Property, TokenDriver};

pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    Present(String),
    Absent,
}

impl Presence {
    /// True when the token the session was opened for is no longer inserted.
    pub fn is_removed(&self, session_token: Option<&str>) -> bool {
        match (self, session_token) {
            (Presence::Absent, _) => true,
            (Presence::Present(id), Some(expected)) => id != expected,
            (Presence::Present(_), None) => false,
        }
    }
}

/// Periodically reads `TokenID`, independent of any running command, and
/// publishes changes on a watch channel. The task stops when the watcher drops.
pub struct PresenceWatcher {
    rx: watch::Receiver<Presence>,
    handle: JoinHandle<()>,
}

impl PresenceWatcher {
    pub fn spawn(driver: Arc<dyn TokenDriver>, interval: Duration) -> Self {
        let initial = read_presence(driver.as_ref());
        let (tx, rx) = watch::channel(initial);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let presence = read_presence(driver.as_ref());
                tx.send_if_modified(|current| {
                    if *current == presence {
                        return false;
                    }
                    info!(?presence, "Token presence changed");
                    *current = presence;
                    true
                });
            }
        });

        Self { rx, handle }
    }

    pub fn subscribe(&self) -> watch::Receiver<Presence> {
        self.rx.clone()
    }

    pub fn current(&self) -> Presence {
        self.rx.borrow().clone()
    }
}

impl Drop for PresenceWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn read_presence(driver: &dyn TokenDriver) -> Presence {
    match driver.read(Property::TokenId) {
        Some(id) if !id.is_empty() => Presence::Present(id),
        _ => Presence::Absent,
    }
}

/// Resolves once the observed presence no longer matches the session token.
/// Never resolves if the observer goes away.
pub(crate) async fn wait_for_removal(rx: &mut watch::Receiver<Presence>, session_token: Option<&str>) {
    loop {
        if rx.borrow_and_update().is_removed(session_token) {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SoftwareToken;

    #[test]
    fn test_is_removed() {
        assert!(Presence::Absent.is_removed(None));
        assert!(Presence::Absent.is_removed(Some("a")));
        assert!(Presence::Present("b".to_string()).is_removed(Some("a")));
        assert!(!Presence::Present("a".to_string()).is_removed(Some("a")));
        assert!(!Presence::Present("a".to_string()).is_removed(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_publishes_removal() {
        let token = Arc::new(SoftwareToken::new("tok-1"));
        let watcher = PresenceWatcher::spawn(
            token.clone() as Arc<dyn TokenDriver>,
            Duration::from_millis(500),
        );
        assert_eq!(watcher.current(), Presence::Present("tok-1".to_string()));

        let mut rx = watcher.subscribe();
        token.remove();
        tokio::time::timeout(Duration::from_secs(2), wait_for_removal(&mut rx, Some("tok-1")))
            .await
            .unwrap();
        assert_eq!(watcher.current(), Presence::Absent);

        token.insert("tok-2");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(watcher.current(), Presence::Present("tok-2".to_string()));
    }
}
