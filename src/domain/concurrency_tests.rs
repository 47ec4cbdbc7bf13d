//! Concurrency tests for single-consumption approvals and the status
//! compare-and-set.

#[cfg(test)]
mod concurrency_tests {
    use chrono::{Duration, Utc};
    use futures_util::future::join_all;
    use std::sync::Arc;

    use crate::domain::entities::account_mode::AccountMode;
    use crate::domain::entities::trade_request::{TradeAction, TradeDetails, TradeRequest, TradeStatus};
    use crate::domain::errors::StoreError;
    use crate::domain::repositories::trade_store::TradeRequestStore;
    use crate::domain::services::approval_broker::{ApprovalBroker, ApprovalConfig};
    use crate::domain::test_support::{memory_store, MockNotifier};

    fn details() -> TradeDetails {
        TradeDetails::market("AAPL", TradeAction::Buy, 1.0, AccountMode::Paper).unwrap()
    }

    // ============================================================================
    // SINGLE CONSUMPTION
    // ============================================================================

    /// Many concurrent verifications of one code: exactly one wins
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_verify_single_winner() {
        let notifier = Arc::new(MockNotifier::new());
        let store = memory_store().await;
        let broker = Arc::new(ApprovalBroker::new(notifier, store, ApprovalConfig::default()));
        broker.request_confirmation(details()).await.unwrap();
        let code = broker.pending().await[0].approval_code.clone();

        let attempts = (0..16).map(|_| {
            let broker = broker.clone();
            let code = code.clone();
            tokio::spawn(async move { broker.verify_approval(&code).await })
        });

        let winners = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
    }

    /// Concurrent reject and verify: the record ends in exactly one state
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reject_races_verify() {
        let notifier = Arc::new(MockNotifier::new());
        let store = memory_store().await;
        let broker = Arc::new(ApprovalBroker::new(notifier, store.clone(), ApprovalConfig::default()));
        let trade_id = broker.request_confirmation(details()).await.unwrap();
        let code = broker.pending().await[0].approval_code.clone();

        let verify = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.verify_approval(&code).await })
        };
        let reject = {
            let broker = broker.clone();
            let trade_id = trade_id.clone();
            tokio::spawn(async move { broker.reject(&trade_id).await })
        };

        let approved = verify.await.unwrap().unwrap().is_some();
        let rejected = reject.await.unwrap().unwrap();
        assert!(approved ^ rejected);

        let status = store.get_request(&trade_id).await.unwrap().unwrap().status;
        let expected = if approved {
            TradeStatus::Approved
        } else {
            TradeStatus::Rejected
        };
        assert_eq!(status, expected);
    }

    // ============================================================================
    // STATUS COMPARE-AND-SET
    // ============================================================================

    /// Racing approved -> submitted transitions: one success, rest conflict
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submission_transition() {
        let store = memory_store().await;
        let now = Utc::now();
        let request = TradeRequest::new_pending(
            "CAS000000001".to_string(),
            "CASCOD".to_string(),
            details(),
            now,
            now + Duration::minutes(15),
        );
        store.create_request(&request).await.unwrap();
        store
            .transition("CAS000000001", TradeStatus::Pending, TradeStatus::Approved)
            .await
            .unwrap();

        let attempts = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .transition("CAS000000001", TradeStatus::Approved, TradeStatus::Submitted)
                    .await
            })
        });

        let results: Vec<Result<(), StoreError>> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, StoreError::StatusConflict { actual: TradeStatus::Submitted, .. })));
    }
}
