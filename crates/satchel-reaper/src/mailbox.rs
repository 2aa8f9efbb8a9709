//! Remote mailbox access used by the reaper.
//!
//! Remote deletion is best effort: the remote server is outside the local
//! consistency domain, so every failure here is logged by the caller and
//! local cleanup proceeds regardless. Every call is bounded by a timeout so
//! one unreachable mailbox cannot stall a batch.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use satchel_shared::UserId;

use crate::error::MailboxError;

/// Opens sessions against the mailbox that holds a user's messages.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Users with the same account share one session per batch.
    fn account(&self, user: UserId) -> String {
        format!("user:{user}")
    }

    async fn connect(&self, user: UserId) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// An authenticated mailbox session.
#[async_trait]
pub trait MailboxSession: Send {
    /// Permanently remove the message with server UID `uid` from `folder`.
    async fn delete_message(&mut self, folder: &str, uid: u32) -> Result<(), MailboxError>;

    async fn logout(&mut self) -> Result<(), MailboxError>;
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, MailboxError>>,
) -> Result<T, MailboxError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| MailboxError::Timeout)?
}

/// Sessions opened during one batch, keyed by mailbox account.
///
/// A session that errors is discarded; an account whose connect attempt
/// failed is not retried within the same batch.
pub struct SessionPool {
    connector: Option<Arc<dyn MailboxConnector>>,
    timeout: Duration,
    sessions: HashMap<String, Box<dyn MailboxSession>>,
    unreachable: HashSet<String>,
}

impl SessionPool {
    pub fn new(connector: Option<Arc<dyn MailboxConnector>>, timeout: Duration) -> Self {
        Self {
            connector,
            timeout,
            sessions: HashMap::new(),
            unreachable: HashSet::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.connector.is_some()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Delete one remote message. `Ok(false)` means remote deletion is
    /// disabled for this deployment.
    pub async fn delete(&mut self, user: UserId, folder: &str, uid: u32) -> Result<bool, MailboxError> {
        let Some(connector) = self.connector.clone() else {
            debug!(user_id = %user, uid, "remote mailbox disabled, skipping");
            return Ok(false);
        };
        let account = connector.account(user);
        if self.unreachable.contains(&account) {
            return Err(MailboxError::Unavailable(
                "unreachable earlier in this batch".into(),
            ));
        }

        let mut session = match self.sessions.remove(&account) {
            Some(session) => session,
            None => match bounded(self.timeout, connector.connect(user)).await {
                Ok(session) => session,
                Err(e) => {
                    self.unreachable.insert(account);
                    return Err(e);
                }
            },
        };

        let result = bounded(self.timeout, session.delete_message(folder, uid)).await;
        match &result {
            Ok(()) => {
                self.sessions.insert(account, session);
            }
            Err(e) => {
                warn!(user_id = %user, error = %e, "dropping mailbox session after error");
            }
        }
        result.map(|()| true)
    }

    /// Log out of every open session, giving up at `deadline`. Sessions
    /// still open then are dropped, which closes their connections.
    pub async fn close_all(&mut self, deadline: Instant) {
        for (account, mut session) in self.sessions.drain() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                debug!(account, "batch budget spent, closing session without logout");
                continue;
            }
            if let Err(e) = bounded(self.timeout.min(left), session.logout()).await {
                debug!(account, error = %e, "logout failed");
            }
        }
        self.unreachable.clear();
    }
}
