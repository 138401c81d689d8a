//! Request/response correlation across sockets.
//!
//! A Soulseek exchange often starts on one socket and resolves on another:
//! we solicit a connection through the server and the answer is a fresh
//! inbound socket on the listener. The [`Waiter`] bridges these: one task
//! registers a pending result under a [`WaitKey`] and blocks on it, any
//! other task completes or faults it by key.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::connection::ConnectionError;
use crate::constants::DEFAULT_WAIT_TIMEOUT;

/// A composite key identifying one pending exchange. Equality is
/// structural over the ordered parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    parts: Vec<String>,
}

impl WaitKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    /// An indirect connection solicitation, resolved by the listener when
    /// the peer's `PierceFirewall` arrives bearing our token.
    pub fn solicited_connection(username: &str, token: u32) -> Self {
        Self::new([
            "solicited-connection".to_string(),
            username.to_string(),
            token.to_string(),
        ])
    }

    /// An inbound transfer connection, resolved when the peer's transfer
    /// socket delivers its token preamble.
    pub fn direct_transfer(username: &str, token: u32) -> Self {
        Self::new([
            "direct-transfer".to_string(),
            username.to_string(),
            token.to_string(),
        ])
    }

    /// A share listing requested from a peer.
    pub fn peer_browse(username: &str) -> Self {
        Self::new(["peer-browse", username])
    }

    /// An address lookup sent to the server.
    pub fn user_address(username: &str) -> Self {
        Self::new(["user-address", username])
    }

    /// The pending login exchange with the server; at most one is ever in
    /// flight per session.
    pub fn login() -> Self {
        Self::new(["login"])
    }
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join(":"))
    }
}

type WaitValue = Box<dyn Any + Send>;
type WaitResult = Result<WaitValue, ConnectionError>;

struct PendingWait {
    id: u64,
    tx: oneshot::Sender<WaitResult>,
}

/// The key → future registry.
///
/// Values are type-erased; `wait::<T>` downcasts on resolution. A
/// completion arriving before anyone waits is buffered so the late waiter
/// picks it up. Duplicate keys stack, newest shadowing oldest: `complete`
/// resolves the most recent registration first.
pub struct Waiter {
    pending: Mutex<HashMap<WaitKey, Vec<PendingWait>>>,
    ready: Mutex<HashMap<WaitKey, VecDeque<WaitValue>>>,
    next_id: AtomicU64,
    default_timeout: Duration,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_TIMEOUT)
    }
}

impl Waiter {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ready: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_timeout,
        }
    }

    /// Registers a pending result under `key` and blocks on it.
    ///
    /// Resolves immediately if a buffered completion is already sitting
    /// under the key. Fails with [`ConnectionError::Timeout`] after the
    /// deadline (the registry default if `wait_timeout` is `None`) and
    /// with [`ConnectionError::Cancelled`] if `cancel` fires first.
    pub async fn wait<T: Any + Send>(
        &self,
        key: WaitKey,
        wait_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<T, ConnectionError> {
        if let Some(value) = self.take_ready(&key) {
            return downcast(value);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .entry(key.clone())
            .or_default()
            .push(PendingWait { id, tx });
        trace!("wait registered under {} ({})", key, id);

        let deadline = wait_timeout.unwrap_or(self.default_timeout);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            received = timeout(deadline, rx) => match received {
                Err(_) => Err(ConnectionError::Timeout),
                // Sender dropped without resolving; shutdown in progress.
                Ok(Err(_)) => Err(ConnectionError::Cancelled),
                Ok(Ok(result)) => result,
            },
        };

        match outcome {
            Ok(value) => downcast(value),
            Err(e) => {
                self.remove_pending(&key, id);
                Err(e)
            }
        }
    }

    /// Resolves the newest waiter under `key`, or buffers the value for a
    /// waiter yet to register.
    pub fn complete<T: Any + Send>(&self, key: &WaitKey, value: T) {
        let mut value: Option<WaitValue> = Some(Box::new(value));
        {
            let mut pending = self.pending.lock();
            if let Some(mut stack) = pending.remove(key) {
                // Newest first; a waiter that already gave up hands the
                // value back and the next one gets it.
                while let Some(wait) = stack.pop() {
                    let Some(boxed) = value.take() else { break };
                    match wait.tx.send(Ok(boxed)) {
                        Ok(()) => {
                            trace!("wait under {} completed", key);
                            break;
                        }
                        Err(Ok(returned)) => value = Some(returned),
                        Err(Err(_)) => break,
                    }
                }
                if !stack.is_empty() {
                    pending.insert(key.clone(), stack);
                }
            }
        }
        if let Some(boxed) = value {
            trace!("completion under {} buffered ahead of wait", key);
            self.ready.lock().entry(key.clone()).or_default().push_back(boxed);
        }
    }

    /// Faults every waiter registered under `key`.
    pub fn throw(&self, key: &WaitKey, error: ConnectionError) {
        if let Some(stack) = self.pending.lock().remove(key) {
            for wait in stack {
                let _ = wait.tx.send(Err(error.clone()));
            }
        }
    }

    /// Faults every outstanding waiter; used at shutdown.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingWait> = self
            .pending
            .lock()
            .drain()
            .flat_map(|(_, stack)| stack)
            .collect();
        for wait in drained {
            let _ = wait.tx.send(Err(ConnectionError::Cancelled));
        }
        self.ready.lock().clear();
    }

    /// Number of waiters currently registered under `key`.
    pub fn pending_count(&self, key: &WaitKey) -> usize {
        self.pending.lock().get(key).map_or(0, Vec::len)
    }

    fn take_ready(&self, key: &WaitKey) -> Option<WaitValue> {
        let mut ready = self.ready.lock();
        let (value, empty) = {
            let queue = ready.get_mut(key)?;
            (queue.pop_front(), queue.is_empty())
        };
        if empty {
            ready.remove(key);
        }
        value
    }

    fn remove_pending(&self, key: &WaitKey, id: u64) {
        let mut pending = self.pending.lock();
        let empty = match pending.get_mut(key) {
            Some(stack) => {
                stack.retain(|wait| wait.id != id);
                stack.is_empty()
            }
            None => return,
        };
        if empty {
            pending.remove(key);
        }
    }
}

fn downcast<T: Any + Send>(value: WaitValue) -> Result<T, ConnectionError> {
    value
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| ConnectionError::Protocol("wait resolved with unexpected type".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel_token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_complete_resolves_wait() {
        let waiter = Waiter::default();
        let key = WaitKey::peer_browse("alice");

        let token = cancel_token();
        let wait = waiter.wait::<u32>(key.clone(), Some(Duration::from_secs(1)), &token);
        tokio::pin!(wait);

        waiter.complete(&key, 7u32);
        assert_eq!(wait.await.unwrap(), 7);
        assert_eq!(waiter.pending_count(&key), 0);
    }

    #[tokio::test]
    async fn test_complete_before_wait_is_buffered() {
        let waiter = Waiter::default();
        let key = WaitKey::direct_transfer("bob", 42);

        waiter.complete(&key, String::from("early"));
        let value: String = waiter
            .wait(key.clone(), Some(Duration::from_millis(50)), &cancel_token())
            .await
            .unwrap();
        assert_eq!(value, "early");

        // The buffered value was consumed.
        let err = waiter
            .wait::<String>(key, Some(Duration::from_millis(20)), &cancel_token())
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::Timeout);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let waiter = Waiter::default();
        let key = WaitKey::user_address("carol");

        let err = waiter
            .wait::<u32>(key.clone(), Some(Duration::from_millis(20)), &cancel_token())
            .await
            .unwrap_err();
        assert_eq!(err, ConnectionError::Timeout);
        assert_eq!(waiter.pending_count(&key), 0);
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let waiter = Waiter::default();
        let key = WaitKey::peer_browse("dave");
        let cancel = cancel_token();

        let wait = waiter.wait::<u32>(key.clone(), Some(Duration::from_secs(5)), &cancel);
        tokio::pin!(wait);
        cancel.cancel();

        assert_eq!(wait.await.unwrap_err(), ConnectionError::Cancelled);
        assert_eq!(waiter.pending_count(&key), 0);
    }

    #[tokio::test]
    async fn test_throw_faults_waiters() {
        let waiter = Waiter::default();
        let key = WaitKey::solicited_connection("erin", 9);

        let token = cancel_token();
        let wait = waiter.wait::<u32>(key.clone(), Some(Duration::from_secs(5)), &token);
        tokio::pin!(wait);
        // Drive the wait far enough to register.
        assert!(
            tokio::time::timeout(Duration::from_millis(10), &mut wait)
                .await
                .is_err()
        );

        waiter.throw(&key, ConnectionError::Connect("refused".into()));
        assert_eq!(
            wait.await.unwrap_err(),
            ConnectionError::Connect("refused".into())
        );
    }

    #[tokio::test]
    async fn test_newest_wait_shadows_oldest() {
        let waiter = Waiter::new(Duration::from_secs(5));
        let key = WaitKey::peer_browse("frank");
        let cancel = cancel_token();

        let older = waiter.wait::<u32>(key.clone(), None, &cancel);
        tokio::pin!(older);
        // Drive the older wait far enough to register.
        assert!(
            tokio::time::timeout(Duration::from_millis(10), &mut older)
                .await
                .is_err()
        );

        let newer = waiter.wait::<u32>(key.clone(), None, &cancel);
        tokio::pin!(newer);
        assert!(
            tokio::time::timeout(Duration::from_millis(10), &mut newer)
                .await
                .is_err()
        );

        waiter.complete(&key, 1u32);
        assert_eq!(newer.await.unwrap(), 1);

        waiter.complete(&key, 2u32);
        assert_eq!(older.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_all_faults_everything() {
        let waiter = Waiter::default();
        let first = WaitKey::peer_browse("gale");
        let second = WaitKey::user_address("hank");

        let token = cancel_token();
        let wait_first = waiter.wait::<u32>(first, Some(Duration::from_secs(5)), &token);
        let wait_second = waiter.wait::<u32>(second, Some(Duration::from_secs(5)), &token);
        tokio::pin!(wait_first, wait_second);
        // Drive both far enough to register.
        assert!(
            tokio::time::timeout(Duration::from_millis(10), &mut wait_first)
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(10), &mut wait_second)
                .await
                .is_err()
        );

        waiter.cancel_all();
        assert_eq!(wait_first.await.unwrap_err(), ConnectionError::Cancelled);
        assert_eq!(wait_second.await.unwrap_err(), ConnectionError::Cancelled);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_a_protocol_error() {
        let waiter = Waiter::default();
        let key = WaitKey::peer_browse("iris");

        waiter.complete(&key, 5u64);
        let err = waiter
            .wait::<u32>(key, Some(Duration::from_millis(50)), &cancel_token())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(_)));
    }
}
