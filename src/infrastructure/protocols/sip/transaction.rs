//! SIP Transaction Store
//!
//! Tracks every outgoing request that still expects a final response and
//! decides, on each periodic sweep, which ones to re-send and which ones to
//! give up on.
//!
//! ## Timing
//! - A transaction is retried once more than `retry_interval` has passed since
//!   its last send and it has been retried fewer than `max_retries` times.
//! - It is expired once more than `transaction_timeout` has passed since it
//!   was created, whatever its retry count.
//! - Both bounds are exclusive: a sweep landing exactly on one does nothing.
//! - Every retry carries a fresh branch; the Call-ID never changes.
//!
//! The store does no I/O. Callers pass the current instant in, which keeps
//! the sweep deterministic under test.

use super::message::{ParsedMessage, SipMethod};
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// RFC 3261 magic cookie every branch must start with
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generate a new branch parameter
pub fn generate_branch() -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("{}{:x}", BRANCH_MAGIC_COOKIE, random)
}

/// Identifies the live transaction for one request on one call
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CorrelationId {
    pub call_id: String,
    pub method: SipMethod,
}

impl CorrelationId {
    pub fn new(call_id: impl Into<String>, method: SipMethod) -> Self {
        Self {
            call_id: call_id.into(),
            method,
        }
    }

    /// Correlation id a response belongs to, from its Call-ID and CSeq method
    pub fn from_response(response: &ParsedMessage) -> Option<Self> {
        let call_id = response.call_id()?;
        let (_, method) = response.cseq()?;
        Some(Self::new(call_id, method))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.call_id, self.method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Register,
    Invite,
    Other,
}

impl From<SipMethod> for TransactionKind {
    fn from(method: SipMethod) -> Self {
        match method {
            SipMethod::Register => TransactionKind::Register,
            SipMethod::Invite => TransactionKind::Invite,
            _ => TransactionKind::Other,
        }
    }
}

/// Retry and timeout settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_interval: Duration,
    pub transaction_timeout: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(2),
            transaction_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// The parts of a request that stay fixed across re-sends
#[derive(Debug, Clone, Default)]
pub struct RequestTemplate {
    pub target: String,
    /// Our From tag
    pub local_tag: String,
    pub to_uri: String,
    pub to_tag: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub extra: Vec<(String, String)>,
    /// Where to send it when not the registrar
    pub destination: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: CorrelationId,
    pub kind: TransactionKind,
    pub branch: String,
    pub cseq: u32,
    pub created_at: Instant,
    pub last_sent_at: Instant,
    pub retry_count: u32,
    /// A challenge has already been answered for this transaction
    pub auth_attempted: bool,
    /// A provisional response arrived; stop re-sending
    pub provisional_received: bool,
    pub request: RequestTemplate,
}

impl Transaction {
    pub fn method(&self) -> SipMethod {
        self.id.method
    }

    /// Regenerate the branch and count one more send
    pub fn mark_resent(&mut self, cseq: u32, now: Instant) {
        self.branch = generate_branch();
        self.cseq = cseq;
        self.retry_count += 1;
        self.last_sent_at = now;
    }
}

/// What the sweep decided for one transaction
#[derive(Debug, Clone)]
pub enum SweepAction {
    /// Re-send; the transaction already carries its new branch and count
    Retry(CorrelationId),
    /// Lifetime exceeded; the transaction has been removed
    Expired(Transaction),
}

#[derive(Debug)]
pub struct TransactionStore {
    transactions: HashMap<CorrelationId, Transaction>,
    policy: RetryPolicy,
}

impl TransactionStore {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            transactions: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a newly sent request. Replaces any live transaction with the same id.
    pub fn start(
        &mut self,
        id: CorrelationId,
        cseq: u32,
        request: RequestTemplate,
        now: Instant,
    ) -> &Transaction {
        let transaction = Transaction {
            id: id.clone(),
            kind: TransactionKind::from(id.method),
            branch: generate_branch(),
            cseq,
            created_at: now,
            last_sent_at: now,
            retry_count: 0,
            auth_attempted: false,
            provisional_received: false,
            request,
        };

        if self.transactions.contains_key(&id) {
            warn!("Replacing live transaction {}", id);
        }
        debug!("Created transaction {} (branch {})", id, transaction.branch);

        self.transactions.insert(id.clone(), transaction);
        &self.transactions[&id]
    }

    pub fn get(&self, id: &CorrelationId) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    pub fn get_mut(&mut self, id: &CorrelationId) -> Option<&mut Transaction> {
        self.transactions.get_mut(id)
    }

    /// Remove a transaction once its final response is handled
    pub fn resolve(&mut self, id: &CorrelationId) -> Option<Transaction> {
        let transaction = self.transactions.remove(id);
        if transaction.is_some() {
            debug!("Resolved transaction {}", id);
        }
        transaction
    }

    /// Drop every transaction belonging to a call
    pub fn remove_call(&mut self, call_id: &str) -> usize {
        let before = self.transactions.len();
        self.transactions.retain(|id, _| id.call_id != call_id);
        before - self.transactions.len()
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Decide retries and expiries as of `now`.
    ///
    /// Actions come back oldest transaction first.
    pub fn on_timeout_sweep(&mut self, now: Instant) -> Vec<SweepAction> {
        let mut ids: Vec<(Instant, CorrelationId)> = self
            .transactions
            .values()
            .map(|t| (t.created_at, t.id.clone()))
            .collect();
        ids.sort_by_key(|(created_at, _)| *created_at);

        let mut actions = Vec::new();
        for (_, id) in ids {
            let Some(transaction) = self.transactions.get_mut(&id) else {
                continue;
            };

            if now.saturating_duration_since(transaction.created_at)
                > self.policy.transaction_timeout
            {
                if let Some(expired) = self.transactions.remove(&id) {
                    info!(
                        "Transaction {} timed out after {} retries",
                        id, expired.retry_count
                    );
                    actions.push(SweepAction::Expired(expired));
                }
                continue;
            }

            if transaction.provisional_received {
                continue;
            }

            if now.saturating_duration_since(transaction.last_sent_at)
                > self.policy.retry_interval
                && transaction.retry_count < self.policy.max_retries
            {
                transaction.branch = generate_branch();
                transaction.retry_count += 1;
                transaction.last_sent_at = now;
                debug!(
                    "Retrying transaction {} (attempt {}, branch {})",
                    id, transaction.retry_count, transaction.branch
                );
                actions.push(SweepAction::Retry(id));
            }
        }
        actions
    }
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn millis(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn invite_id() -> CorrelationId {
        CorrelationId::new("call-1@10.0.0.1", SipMethod::Invite)
    }

    #[test]
    fn test_generate_branch() {
        let a = generate_branch();
        let b = generate_branch();
        assert!(a.starts_with(BRANCH_MAGIC_COOKIE));
        assert_ne!(a, b);
    }

    #[test]
    fn test_start_and_resolve() {
        let mut store = TransactionStore::default();
        let now = Instant::now();

        let tx = store.start(invite_id(), 1, RequestTemplate::default(), now);
        assert_eq!(tx.kind, TransactionKind::Invite);
        assert_eq!(tx.retry_count, 0);
        assert!(tx.branch.starts_with(BRANCH_MAGIC_COOKIE));
        assert_eq!(store.len(), 1);

        assert!(store.resolve(&invite_id()).is_some());
        assert!(store.is_empty());
        assert!(store.resolve(&invite_id()).is_none());
    }

    #[test]
    fn test_start_replaces_live_entry() {
        let mut store = TransactionStore::default();
        let now = Instant::now();

        store.start(invite_id(), 1, RequestTemplate::default(), now);
        store.start(invite_id(), 2, RequestTemplate::default(), now);

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&invite_id()).unwrap().cseq, 2);
    }

    #[test]
    fn test_retry_only_after_interval_exceeded() {
        let mut store = TransactionStore::default();
        let start = Instant::now();
        store.start(invite_id(), 1, RequestTemplate::default(), start);

        assert!(store.on_timeout_sweep(start + millis(1999)).is_empty());
        assert!(store.on_timeout_sweep(start + secs(2)).is_empty());
        assert_eq!(store.on_timeout_sweep(start + millis(2001)).len(), 1);
    }

    #[test]
    fn test_expiry_only_after_timeout_exceeded() {
        let mut store = TransactionStore::default();
        let start = Instant::now();
        store.start(invite_id(), 1, RequestTemplate::default(), start);
        store.get_mut(&invite_id()).unwrap().provisional_received = true;

        assert!(store.on_timeout_sweep(start + secs(30)).is_empty());
        assert_eq!(store.len(), 1);
        assert!(matches!(
            store.on_timeout_sweep(start + millis(30_001)).as_slice(),
            [SweepAction::Expired(_)]
        ));
    }

    #[test]
    fn test_retry_regenerates_branch() {
        let mut store = TransactionStore::default();
        let start = Instant::now();
        let original = store
            .start(invite_id(), 1, RequestTemplate::default(), start)
            .branch
            .clone();

        let actions = store.on_timeout_sweep(start + millis(2001));
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], SweepAction::Retry(id) if *id == invite_id()));

        let tx = store.get(&invite_id()).unwrap();
        assert_eq!(tx.retry_count, 1);
        assert_ne!(tx.branch, original);
        assert_eq!(tx.id.call_id, "call-1@10.0.0.1");

        // Interval counts from the last attempt
        assert!(store.on_timeout_sweep(start + secs(4)).is_empty());
        assert_eq!(store.on_timeout_sweep(start + millis(4002)).len(), 1);
    }

    #[test]
    fn test_retries_capped_then_expired() {
        let mut store = TransactionStore::default();
        let start = Instant::now();
        store.start(invite_id(), 1, RequestTemplate::default(), start);

        let mut retries = 0;
        for t in 1..30 {
            for action in store.on_timeout_sweep(start + secs(t)) {
                match action {
                    SweepAction::Retry(_) => retries += 1,
                    SweepAction::Expired(_) => panic!("expired early at {}s", t),
                }
            }
        }
        assert_eq!(retries, 3);
        assert_eq!(store.get(&invite_id()).unwrap().retry_count, 3);

        assert!(store.on_timeout_sweep(start + secs(30)).is_empty());
        let actions = store.on_timeout_sweep(start + secs(31));
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            SweepAction::Expired(tx) => assert_eq!(tx.retry_count, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_provisional_stops_retries_not_expiry() {
        let mut store = TransactionStore::default();
        let start = Instant::now();
        store.start(invite_id(), 1, RequestTemplate::default(), start);
        store.get_mut(&invite_id()).unwrap().provisional_received = true;

        assert!(store.on_timeout_sweep(start + secs(5)).is_empty());
        let actions = store.on_timeout_sweep(start + secs(31));
        assert!(matches!(actions.as_slice(), [SweepAction::Expired(_)]));
    }

    #[test]
    fn test_remove_call() {
        let mut store = TransactionStore::default();
        let now = Instant::now();
        store.start(invite_id(), 1, RequestTemplate::default(), now);
        store.start(
            CorrelationId::new("call-1@10.0.0.1", SipMethod::Bye),
            2,
            RequestTemplate::default(),
            now,
        );
        store.start(
            CorrelationId::new("reg@10.0.0.1", SipMethod::Register),
            3,
            RequestTemplate::default(),
            now,
        );

        assert_eq!(store.remove_call("call-1@10.0.0.1"), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_custom_policy() {
        let policy = RetryPolicy {
            retry_interval: Duration::from_millis(100),
            transaction_timeout: Duration::from_millis(500),
            max_retries: 1,
        };
        let mut store = TransactionStore::new(policy);
        let start = Instant::now();
        store.start(invite_id(), 1, RequestTemplate::default(), start);

        assert_eq!(store.on_timeout_sweep(start + millis(101)).len(), 1);
        assert!(store.on_timeout_sweep(start + millis(300)).is_empty());
        assert!(matches!(
            store.on_timeout_sweep(start + millis(501)).as_slice(),
            [SweepAction::Expired(_)]
        ));
    }
}
