//! Out-of-band trade confirmation.
//!
//! Issues confirmation requests over the notification channel, matches
//! inbound replies to pending requests and expires requests nobody answered.
//! Only pending records are held in memory. A record leaves the map once its
//! decision has moved the stored request out of `pending`; if that write
//! fails the record stays answerable.

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::entities::confirmation::{ApprovalVia, ApprovedTrade, ConfirmationRecord};
use crate::domain::entities::trade_request::{TradeDetails, TradeRequest, TradeStatus};
use crate::domain::errors::{ConfirmationError, StoreError};
use crate::domain::repositories::notification::{InboundMessage, NotificationService};
use crate::domain::repositories::trade_store::TradeRequestStore;

/// Characters used for approval codes; no 0/O or 1/I/L
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 6;
const TRADE_ID_BYTES: usize = 6;

#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// How long a confirmation stays answerable
    pub confirmation_window: Duration,
    /// Allowed clock skew between request and reply timestamps
    pub replay_tolerance: Duration,
    /// Number of recent inbound messages scanned per check
    pub reply_scan_limit: usize,
    pub approval_keywords: Vec<String>,
    /// Capacity of the seen-message cache
    pub seen_message_capacity: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            confirmation_window: Duration::minutes(15),
            replay_tolerance: Duration::seconds(5),
            reply_scan_limit: 10,
            approval_keywords: vec![
                "APPROVE".to_string(),
                "APPROVED".to_string(),
                "YES".to_string(),
                "CONFIRM".to_string(),
            ],
            seen_message_capacity: 1024,
        }
    }
}

/// Result of a bounded wait for a human reply
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Approved(ApprovedTrade),
    TimedOut { still_pending: usize },
    NothingPending,
}

/// How a decision write ended
enum Settled {
    Written,
    /// The request had already left `pending`
    Stale(TradeStatus),
}

struct BrokerState {
    records: HashMap<String, ConfirmationRecord>,
    /// Identifiers handed out to requests still being issued
    reserved: HashSet<String>,
    seen_messages: LruCache<String, ()>,
}

impl BrokerState {
    fn is_taken(&self, candidate: &str) -> bool {
        self.reserved.contains(candidate)
            || self.records.contains_key(candidate)
            || self.records.values().any(|r| r.approval_code == candidate)
    }
}

pub struct ApprovalBroker {
    notifier: Arc<dyn NotificationService>,
    store: Arc<dyn TradeRequestStore>,
    config: ApprovalConfig,
    keywords: Vec<String>,
    state: Mutex<BrokerState>,
}

impl ApprovalBroker {
    pub fn new(
        notifier: Arc<dyn NotificationService>,
        store: Arc<dyn TradeRequestStore>,
        config: ApprovalConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.seen_message_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let keywords = config
            .approval_keywords
            .iter()
            .map(|k| k.trim().to_uppercase())
            .filter(|k| !k.is_empty())
            .collect();

        Self {
            notifier,
            store,
            config,
            keywords,
            state: Mutex::new(BrokerState {
                records: HashMap::new(),
                reserved: HashSet::new(),
                seen_messages: LruCache::new(capacity),
            }),
        }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    /// Ask a human to confirm `details`.
    ///
    /// The notification goes out first; if it fails nothing is created,
    /// since an un-notified request can never be confirmed. The state lock
    /// is only held while identifiers are reserved and while the finished
    /// record is inserted, never across the notification or the store.
    pub async fn request_confirmation(&self, details: TradeDetails) -> Result<String, ConfirmationError> {
        let (trade_id, approval_code) = {
            let mut state = self.state.lock().await;
            let (trade_id, approval_code) = generate_identifiers(|candidate| state.is_taken(candidate));
            state.reserved.insert(trade_id.clone());
            state.reserved.insert(approval_code.clone());
            (trade_id, approval_code)
        };

        let issued = self.issue(&trade_id, &approval_code, details).await;

        let mut state = self.state.lock().await;
        state.reserved.remove(&trade_id);
        state.reserved.remove(&approval_code);
        let record = issued?;
        state.records.insert(trade_id.clone(), record);

        Ok(trade_id)
    }

    async fn issue(
        &self,
        trade_id: &str,
        approval_code: &str,
        details: TradeDetails,
    ) -> Result<ConfirmationRecord, ConfirmationError> {
        let requested_at = Utc::now();
        let expires_at = requested_at + self.config.confirmation_window;

        let message = format!(
            "Trade approval requested: {}. Reply \"APPROVE {}\" or use code {} within {} min.",
            details.summary(),
            trade_id,
            approval_code,
            self.config.confirmation_window.num_minutes().max(1)
        );

        if let Err(e) = self.notifier.send(&message).await {
            error!(
                trade_id = %trade_id,
                symbol = %details.symbol,
                "Confirmation notification failed, no request created: {}",
                e
            );
            return Err(ConfirmationError::NotificationFailed(e.to_string()));
        }

        let request = TradeRequest::new_pending(
            trade_id.to_string(),
            approval_code.to_string(),
            details.clone(),
            requested_at,
            expires_at,
        );
        self.store.create_request(&request).await?;

        let record = ConfirmationRecord::new(
            trade_id.to_string(),
            approval_code.to_string(),
            details,
            requested_at,
            expires_at,
        );
        self.store.save_confirmation(&record).await?;

        info!(
            "📨 Confirmation requested for {} ({}), expires at {}",
            trade_id,
            record.details().summary(),
            expires_at
        );
        Ok(record)
    }

    /// Consume the pending confirmation whose approval code is `approval_code`.
    ///
    /// Returns `None` if no live record carries the code. A code approves at
    /// most once.
    pub async fn verify_approval(
        &self,
        approval_code: &str,
    ) -> Result<Option<ApprovedTrade>, ConfirmationError> {
        let code = approval_code.trim().to_uppercase();
        if code.is_empty() {
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        let now = Utc::now();
        self.evict_expired(&mut state.records, now).await;

        let trade_id = state
            .records
            .values()
            .find(|r| r.approval_code == code && r.is_live_at(now))
            .map(|r| r.trade_id.clone());

        let Some(trade_id) = trade_id else {
            debug!("No pending confirmation for code {}", code);
            return Ok(None);
        };

        self.consume(&mut state.records, &trade_id, ApprovalVia::ExplicitCode, now)
            .await
    }

    /// Scan recent inbound replies for an approval.
    ///
    /// A reply naming one pending trade id (or its approval code) approves
    /// that trade. A reply naming none approves only when exactly one trade
    /// is pending. Replies older than their request, or naming several
    /// trades, are refused and logged; they return the same `None` as a miss.
    /// An accepted reply is only marked seen once its approval is stored.
    pub async fn check_for_reply(&self) -> Result<Option<ApprovedTrade>, ConfirmationError> {
        if self.state.lock().await.records.is_empty() {
            return Ok(None);
        }

        let mut messages = self
            .notifier
            .list_recent_inbound(self.config.reply_scan_limit)
            .await
            .map_err(|e| ConfirmationError::NotificationFailed(e.to_string()))?;
        messages.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        messages.truncate(self.config.reply_scan_limit);

        let mut state = self.state.lock().await;
        let now = Utc::now();
        self.evict_expired(&mut state.records, now).await;

        let pending: Vec<&ConfirmationRecord> =
            state.records.values().filter(|r| r.is_live_at(now)).collect();
        if pending.is_empty() {
            return Ok(None);
        }

        let mut accepted: Option<(String, String)> = None;
        let mut refused: Vec<String> = Vec::new();

        for message in &messages {
            if state.seen_messages.contains(&message.id) {
                continue;
            }

            let tokens = tokenize(&message.body);
            if !tokens.iter().any(|t| self.keywords.contains(t)) {
                continue;
            }

            let body = message.body.to_uppercase();
            let named: Vec<&ConfirmationRecord> = pending
                .iter()
                .copied()
                .filter(|r| body.contains(&r.trade_id) || tokens.contains(&r.approval_code))
                .collect();

            let target = match named.len() {
                1 => named[0],
                0 if pending.len() == 1 => pending[0],
                0 => {
                    warn!(
                        message_id = %message.id,
                        pending = pending.len(),
                        "Bare approval reply refused: more than one confirmation is pending"
                    );
                    refused.push(message.id.clone());
                    continue;
                }
                _ => {
                    let ids: Vec<&str> = named.iter().map(|r| r.trade_id.as_str()).collect();
                    warn!(
                        message_id = %message.id,
                        named = ?ids,
                        "Ambiguous approval reply refused: names several pending confirmations"
                    );
                    refused.push(message.id.clone());
                    continue;
                }
            };

            if !self.passes_replay_check(target, message) {
                refused.push(message.id.clone());
                continue;
            }

            accepted = Some((target.trade_id.clone(), message.id.clone()));
            break;
        }

        for id in refused {
            state.seen_messages.put(id, ());
        }

        let Some((trade_id, message_id)) = accepted else {
            return Ok(None);
        };

        let approved = self
            .consume(&mut state.records, &trade_id, ApprovalVia::ReplyMatch, now)
            .await?;
        state.seen_messages.put(message_id.clone(), ());
        if approved.is_some() {
            info!("✅ Reply {} matched confirmation {}", message_id, trade_id);
        }
        Ok(approved)
    }

    /// Reject a pending confirmation. No-op for anything else.
    pub async fn reject(&self, trade_id: &str) -> Result<bool, ConfirmationError> {
        let mut state = self.state.lock().await;
        self.evict_expired(&mut state.records, Utc::now()).await;

        let Some(mut decided) = state.records.get(trade_id).cloned() else {
            debug!("Reject ignored, {} is not pending", trade_id);
            return Ok(false);
        };

        decided.reject();
        let settled = self.persist(&decided, TradeStatus::Rejected).await?;
        state.records.remove(trade_id);

        if let Settled::Stale(actual) = settled {
            warn!("Reject ignored, request {} is already {}", trade_id, actual);
            return Ok(false);
        }
        info!("🚫 Confirmation {} rejected", trade_id);
        Ok(true)
    }

    /// Expire every pending record past its deadline
    pub async fn sweep_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        self.evict_expired(&mut state.records, Utc::now()).await
    }

    /// Poll for a reply until one is accepted or `timeout` elapses.
    ///
    /// Dropping the returned future abandons the wait.
    pub async fn wait_for_reply(
        &self,
        timeout: std::time::Duration,
        poll_interval: std::time::Duration,
    ) -> Result<ReplyOutcome, ConfirmationError> {
        if self.pending_count().await == 0 {
            return Ok(ReplyOutcome::NothingPending);
        }

        let poll = async {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                if let Some(approved) = self.check_for_reply().await? {
                    return Ok::<_, ConfirmationError>(ReplyOutcome::Approved(approved));
                }
                if self.pending_count().await == 0 {
                    return Ok(ReplyOutcome::NothingPending);
                }
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(ReplyOutcome::TimedOut {
                still_pending: self.pending_count().await,
            }),
        }
    }

    /// Reload pending confirmations after a restart.
    ///
    /// Records whose request already left `pending` are skipped.
    pub async fn restore_pending(&self) -> Result<usize, ConfirmationError> {
        let mut live = Vec::new();
        for record in self.store.load_pending_confirmations().await? {
            match self.store.get_request(&record.trade_id).await? {
                Some(request) if request.status == TradeStatus::Pending => live.push(record),
                Some(request) => debug!(
                    "Skipping confirmation {}, request is {}",
                    record.trade_id, request.status
                ),
                None => warn!("Confirmation {} has no trade request", record.trade_id),
            }
        }

        let mut state = self.state.lock().await;
        for record in live {
            state.records.insert(record.trade_id.clone(), record);
        }
        let expired = self.evict_expired(&mut state.records, Utc::now()).await;
        let restored = state.records.len();

        if restored > 0 || expired > 0 {
            info!(
                "Restored {} pending confirmation(s), expired {} stale one(s)",
                restored, expired
            );
        }
        Ok(restored)
    }

    /// Live pending records, oldest first
    pub async fn pending(&self) -> Vec<ConfirmationRecord> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        self.evict_expired(&mut state.records, now).await;
        let mut records: Vec<ConfirmationRecord> = state
            .records
            .values()
            .filter(|r| r.is_live_at(now))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.requested_at);
        records
    }

    pub async fn pending_count(&self) -> usize {
        self.pending().await.len()
    }

    fn passes_replay_check(&self, record: &ConfirmationRecord, message: &InboundMessage) -> bool {
        let earliest = record.requested_at - self.config.replay_tolerance;
        if message.sent_at >= earliest {
            return true;
        }

        let rejection = ConfirmationError::ReplayRejected {
            trade_id: record.trade_id.clone(),
            message_id: message.id.clone(),
            delta_secs: (message.sent_at - record.requested_at).num_seconds(),
        };
        warn!(
            trade_id = %record.trade_id,
            message_id = %message.id,
            from = %message.from,
            sent_at = %message.sent_at,
            requested_at = %record.requested_at,
            code = rejection.kind().error_code(),
            "🔒 {}",
            rejection
        );
        false
    }

    async fn consume(
        &self,
        records: &mut HashMap<String, ConfirmationRecord>,
        trade_id: &str,
        via: ApprovalVia,
        now: DateTime<Utc>,
    ) -> Result<Option<ApprovedTrade>, ConfirmationError> {
        let Some(mut decided) = records.get(trade_id).cloned() else {
            return Ok(None);
        };
        if !decided.approve(via, now) {
            return Ok(None);
        }

        // On a store error the pending record stays in the map
        let settled = self.persist(&decided, TradeStatus::Approved).await?;
        records.remove(trade_id);

        if let Settled::Stale(actual) = settled {
            warn!(
                "Approval of {} dropped, request is already {}",
                trade_id, actual
            );
            return Ok(None);
        }
        info!("👍 Confirmation {} approved via {}", trade_id, via.as_str());

        Ok(Some(ApprovedTrade {
            trade_id: decided.trade_id.clone(),
            approval_code: decided.approval_code.clone(),
            details: decided.details().clone(),
            approved_at: now,
            approved_via: via,
        }))
    }

    /// Move the request out of `pending`, then record the decision.
    ///
    /// The request row is authoritative once it has moved, so a failed
    /// confirmation write is logged rather than returned.
    async fn persist(&self, decided: &ConfirmationRecord, to: TradeStatus) -> Result<Settled, StoreError> {
        match self
            .store
            .transition(&decided.trade_id, TradeStatus::Pending, to)
            .await
        {
            Ok(()) => {}
            Err(StoreError::StatusConflict { actual, .. }) => return Ok(Settled::Stale(actual)),
            Err(e) => return Err(e),
        }

        if let Err(e) = self.store.save_confirmation(decided).await {
            error!(
                "Request {} is {} but its confirmation was not saved: {}",
                decided.trade_id, to, e
            );
        }
        Ok(Settled::Written)
    }

    async fn evict_expired(
        &self,
        records: &mut HashMap<String, ConfirmationRecord>,
        now: DateTime<Utc>,
    ) -> usize {
        let stale: Vec<String> = records
            .values()
            .filter(|r| r.is_pending() && r.is_expired_at(now))
            .map(|r| r.trade_id.clone())
            .collect();

        let mut evicted = 0;
        for trade_id in &stale {
            let Some(mut decided) = records.get(trade_id).cloned() else {
                continue;
            };
            decided.expire();
            match self.persist(&decided, TradeStatus::Expired).await {
                Ok(_) => {
                    records.remove(trade_id);
                    evicted += 1;
                    let expired = ConfirmationError::Expired {
                        trade_id: trade_id.clone(),
                    };
                    info!("⌛ {}", expired);
                }
                Err(e) => warn!("Failed to persist expiry of {}, will retry: {}", trade_id, e),
            }
        }

        evicted
    }
}

/// Fresh trade id and approval code for a request created outside the broker
pub fn fresh_identifiers() -> (String, String) {
    generate_identifiers(|_| false)
}

/// Upper-cased alphanumeric words of a message
fn tokenize(body: &str) -> Vec<String> {
    body.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_uppercase())
        .collect()
}

fn generate_identifiers(taken: impl Fn(&str) -> bool) -> (String, String) {
    let mut rng = rand::thread_rng();
    loop {
        let bytes: [u8; TRADE_ID_BYTES] = rng.gen();
        let trade_id = hex::encode_upper(bytes);
        let approval_code: String = (0..CODE_LENGTH)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();

        if trade_id != approval_code && !taken(&trade_id) && !taken(&approval_code) {
            return (trade_id, approval_code);
        }
    }
}
