//! Confirmation queue scenarios: depth, idempotent submission, broadcast confirmation, resends

mod common;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolEvent};
use common::*;
use vbank_relayer::contracts::bridge::VirtualBankMultiSig;
use vbank_relayer::engine::Clock;
use vbank_relayer::store::TxStore;
use vbank_relayer::types::{BroadcastPayload, OutboundJob, TxReceipt, TxStatus, TxType};

fn deposit_hash() -> B256 {
    B256::repeat_byte(0xab)
}

/// Put a native deposit into block 1000 and let ingestion pick it up
async fn ingest_native_deposit(h: &Harness) {
    let depositor = Address::repeat_byte(0x42);
    h.chain
        .put_block(1000, 0, vec![native_transfer(deposit_hash(), depositor, 5_000)]);
    let event = VirtualBankMultiSig::DepositFunds {
        from: depositor,
        amount: U256::from(5_000u64),
    };
    h.chain.put_receipt(receipt(
        deposit_hash(),
        1000,
        true,
        vec![log_from(bridge(), event.encode_log_data())],
    ));
    h.engine.ingestion().round().await.unwrap();
    assert!(h.engine.unconfirmed().contains(&deposit_hash()).await);
}

#[tokio::test]
async fn test_deposit_reaches_home_chain_exactly_at_depth() {
    let mut config = test_config();
    config.start_height = Some(1000);
    let h = Harness::new(member(1), config);
    h.engine.start_up().await.unwrap();
    ingest_native_deposit(&h).await;
    assert_eq!(h.home.pending_deposits(), 1);

    h.chain.set_height(1029);
    h.engine.confirmation().round().await;
    assert!(h.home.submit_attempts().is_empty());

    h.chain.set_height(1030);
    h.engine.confirmation().round().await;
    let attempts = h.home.submit_attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].value, U256::from(5_000u64));
    assert_eq!(attempts[0].asset_id, 1);
    assert_eq!(attempts[0].height, 1000);

    // Tombstoned until the home chain passes 100 + rollback window
    let record = h.engine.unconfirmed().get(&deposit_hash()).await.unwrap();
    assert!(record.delete_flag);
    assert_eq!(record.delete_height, Some(130));

    h.chain.set_height(1031);
    h.home.set_height(130);
    h.engine.confirmation().round().await;
    assert_eq!(h.home.submit_attempts().len(), 1);
    assert!(h.engine.unconfirmed().contains(&deposit_hash()).await);

    h.home.set_height(131);
    h.engine.confirmation().round().await;
    assert!(!h.engine.unconfirmed().contains(&deposit_hash()).await);
    assert!(h.store.find_unconfirmed(deposit_hash()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_submission_is_treated_as_success() {
    let mut config = test_config();
    config.start_height = Some(1000);
    let h = Harness::new(member(1), config);
    h.engine.start_up().await.unwrap();
    ingest_native_deposit(&h).await;

    // Another member got there first
    h.home.mark_deposited(deposit_hash());
    h.chain.set_height(1030);
    h.engine.confirmation().round().await;

    assert_eq!(h.home.submit_attempts().len(), 1);
    assert_eq!(h.home.on_chain_deposits(), 1);
    let record = h.engine.unconfirmed().get(&deposit_hash()).await.unwrap();
    assert!(record.delete_flag);

    // No retry on later rounds
    h.engine.confirmation().round().await;
    assert_eq!(h.home.submit_attempts().len(), 1);
}

#[tokio::test]
async fn test_reverted_deposit_is_dropped() {
    let mut config = test_config();
    config.start_height = Some(1000);
    let h = Harness::new(member(1), config);
    h.engine.start_up().await.unwrap();
    ingest_native_deposit(&h).await;

    // The receipt flips to failed before confirmation depth (e.g. node resync)
    h.chain
        .put_receipt(receipt(deposit_hash(), 1000, false, vec![]));
    h.chain.set_height(1030);
    h.engine.confirmation().round().await;

    assert!(h.home.submit_attempts().is_empty());
    assert!(!h.engine.unconfirmed().contains(&deposit_hash()).await);
}

fn withdraw_job(nerve_tx_hash: &str, roster: Vec<Address>) -> OutboundJob {
    OutboundJob {
        nerve_tx_hash: nerve_tx_hash.to_string(),
        payload: BroadcastPayload::Withdraw {
            to: Address::repeat_byte(0x77),
            amount: U256::from(10u64),
            is_contract_asset: false,
            erc20: Address::ZERO,
        },
        signatures: Bytes::from(vec![1u8; 65]),
        roster,
    }
}

fn withdraw_call(nerve_tx_hash: &str) -> Vec<u8> {
    VirtualBankMultiSig::createOrSignWithdrawCall {
        txKey: nerve_tx_hash.to_string(),
        to: Address::repeat_byte(0x77),
        amount: U256::from(10u64),
        isContractAsset: false,
        erc20: Address::ZERO,
        signatures: Bytes::from(vec![1u8; 65]),
    }
    .abi_encode()
}

#[tokio::test]
async fn test_completed_broadcast_is_confirmed_once() {
    let mut config = test_config();
    config.start_height = Some(1000);
    let me = member(2);
    let h = Harness::new(me, config);
    h.engine.start_up().await.unwrap();

    let tx_hash = B256::repeat_byte(0xcd);
    let signers = vec![member(1), member(2)];
    let completed = VirtualBankMultiSig::TxWithdrawCompleted {
        txKey: "nerve-1".to_string(),
        signers: signers.clone(),
    };
    h.chain.put_block(
        1000,
        0,
        vec![call_to(tx_hash, member(1), bridge(), withdraw_call("nerve-1"))],
    );
    h.chain.put_receipt(receipt(
        tx_hash,
        1000,
        true,
        vec![log_from(bridge(), completed.encode_log_data())],
    ));
    h.engine.ingestion().round().await.unwrap();

    let record = h.engine.unconfirmed().get(&tx_hash).await.unwrap();
    assert_eq!(record.tx_type, TxType::Withdraw);
    assert_eq!(record.status, TxStatus::Completed);
    assert_eq!(h.home.pending_withdraws(), vec![("nerve-1".to_string(), tx_hash)]);

    h.chain.set_height(1030);
    h.engine.confirmation().round().await;
    h.engine.confirmation().round().await;

    let confirmed = h.home.confirmations();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].nerve_tx_hash, "nerve-1");
    assert_eq!(confirmed[0].external_tx_hash, tx_hash);
    assert_eq!(confirmed[0].signers.len(), 2);
    assert_eq!(confirmed[0].multisig_address, format!("{:#x}", bridge()));
    assert!(h.engine.unconfirmed().get(&tx_hash).await.unwrap().delete_flag);
}

#[tokio::test]
async fn test_failed_broadcast_by_peer_hands_turn_to_this_node() {
    let mut config = test_config();
    config.start_height = Some(1000);
    let me = member(2);
    let h = Harness::new(me, config);
    h.engine.start_up().await.unwrap();

    // This node is second in order and waiting
    h.engine
        .submit_outbound(withdraw_job("nerve-2", vec![member(1), me, member(3)]))
        .await
        .unwrap();
    let waiting = h.engine.waiting().get("nerve-2").await.unwrap();
    assert!(waiting.waiting_end_time > h.clock.now_ms());

    // Member 1 broadcast but the transaction reverted
    let tx_hash = B256::repeat_byte(0xce);
    h.chain.put_block(
        1000,
        0,
        vec![call_to(tx_hash, member(1), bridge(), withdraw_call("nerve-2"))],
    );
    h.chain.put_receipt(receipt(tx_hash, 1000, false, vec![]));
    h.engine.ingestion().round().await.unwrap();
    assert_eq!(
        h.engine.unconfirmed().get(&tx_hash).await.unwrap().status,
        TxStatus::Failed
    );

    h.chain.set_height(1030);
    h.engine.confirmation().round().await;
    assert!(!h.engine.unconfirmed().contains(&tx_hash).await);

    let waiting = h.engine.waiting().get("nerve-2").await.unwrap();
    assert!(waiting.sent_by.is_empty());

    // The waiting queue now lets this node broadcast without waiting out its slot
    h.engine.waiting_scheduler().round().await;
    assert_eq!(h.broadcaster.calls().len(), 1);
    assert_eq!(h.broadcaster.calls()[0].0, "nerve-2");
}

#[tokio::test]
async fn test_deposit_without_receipt_at_depth_is_dropped() {
    let mut config = test_config();
    config.start_height = Some(1000);
    let h = Harness::new(member(1), config);
    h.engine.start_up().await.unwrap();
    ingest_native_deposit(&h).await;

    // The node lost the receipt (reorg or pruning) by the time depth is reached
    h.chain.remove_receipt(deposit_hash());
    h.chain.set_height(1030);
    h.engine.confirmation().round().await;

    assert!(h.home.submit_attempts().is_empty());
    assert!(!h.engine.unconfirmed().contains(&deposit_hash()).await);
    assert!(h.store.find_unconfirmed(deposit_hash()).await.unwrap().is_none());

    // Nothing left to retry
    h.engine.confirmation().round().await;
    assert!(h.home.submit_attempts().is_empty());
}

fn sent_hash(n: u64) -> B256 {
    B256::left_padding_from(&n.to_be_bytes())
}

fn completion_receipt(tx_hash: B256, nerve_tx_hash: &str) -> TxReceipt {
    let completed = VirtualBankMultiSig::TxWithdrawCompleted {
        txKey: nerve_tx_hash.to_string(),
        signers: vec![member(1), member(2)],
    };
    receipt(
        tx_hash,
        1000,
        true,
        vec![log_from(bridge(), completed.encode_log_data())],
    )
}

/// This node broadcasts `nerve_tx_hash` and sees it packed and completed in block 1000
async fn completed_self_broadcast(h: &Harness, nerve_tx_hash: &str) -> B256 {
    h.engine
        .submit_outbound(withdraw_job(nerve_tx_hash, vec![member(1), member(2), member(3)]))
        .await
        .unwrap();
    let tx_hash = sent_hash(1);
    assert_eq!(
        h.engine.unconfirmed().get(&tx_hash).await.unwrap().status,
        TxStatus::Initial
    );

    h.chain.put_block(
        1000,
        0,
        vec![call_to(tx_hash, member(1), bridge(), withdraw_call(nerve_tx_hash))],
    );
    h.chain.put_receipt(completion_receipt(tx_hash, nerve_tx_hash));
    h.engine.ingestion().round().await.unwrap();
    assert_eq!(
        h.engine.unconfirmed().get(&tx_hash).await.unwrap().status,
        TxStatus::Completed
    );
    tx_hash
}

#[tokio::test]
async fn test_reverted_completion_is_resent_with_new_hash() {
    let mut config = test_config();
    config.start_height = Some(1000);
    let h = Harness::new(member(1), config);
    h.engine.start_up().await.unwrap();
    let first = completed_self_broadcast(&h, "nerve-r").await;

    h.chain.put_receipt(receipt(first, 1000, false, vec![]));
    h.chain.set_height(1030);
    h.engine.confirmation().round().await;
    assert_eq!(
        h.engine.unconfirmed().get(&first).await.unwrap().status,
        TxStatus::Resend
    );
    assert!(h.home.confirmations().is_empty());

    h.engine.confirmation().round().await;
    assert!(!h.engine.unconfirmed().contains(&first).await);
    let second = h.engine.unconfirmed().get(&sent_hash(2)).await.unwrap();
    assert_eq!(second.status, TxStatus::Initial);
    assert_eq!(second.tx_type, TxType::Withdraw);
    assert_eq!(second.nerve_tx_hash.as_deref(), Some("nerve-r"));

    let calls = h.broadcaster.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(nerve, _)| nerve == "nerve-r"));
    assert_eq!(h.engine.waiting().get("nerve-r").await.unwrap().resend_count, 2);
}

#[tokio::test]
async fn test_completion_without_logs_is_resent() {
    let mut config = test_config();
    config.start_height = Some(1000);
    let h = Harness::new(member(1), config);
    h.engine.start_up().await.unwrap();
    let tx_hash = completed_self_broadcast(&h, "nerve-l").await;

    h.chain.put_receipt(receipt(tx_hash, 1000, true, vec![]));
    h.chain.set_height(1030);
    h.engine.confirmation().round().await;

    assert_eq!(
        h.engine.unconfirmed().get(&tx_hash).await.unwrap().status,
        TxStatus::Resend
    );
    assert!(h.home.confirmations().is_empty());
}

#[tokio::test]
async fn test_missing_completion_receipt_waits_for_timeout() {
    let mut config = test_config();
    config.start_height = Some(1000);
    let h = Harness::new(member(1), config);
    h.engine.start_up().await.unwrap();
    let tx_hash = completed_self_broadcast(&h, "nerve-m").await;

    h.chain.remove_receipt(tx_hash);
    h.chain.set_height(1030);
    h.engine.confirmation().round().await;
    assert_eq!(
        h.engine.unconfirmed().get(&tx_hash).await.unwrap().status,
        TxStatus::Completed
    );

    h.clock.advance_secs(1801);
    h.engine.confirmation().round().await;
    assert_eq!(
        h.engine.unconfirmed().get(&tx_hash).await.unwrap().status,
        TxStatus::Resend
    );
    assert!(h.home.confirmations().is_empty());
}

#[tokio::test]
async fn test_failed_resends_are_discarded_past_cap() {
    let mut config = test_config();
    config.start_height = Some(1000);
    let h = Harness::new(member(2), config);
    h.engine.start_up().await.unwrap();

    // A peer's completed broadcast this node holds no waiting job for
    let tx_hash = B256::repeat_byte(0xcf);
    h.chain.put_block(
        1000,
        0,
        vec![call_to(tx_hash, member(1), bridge(), withdraw_call("nerve-c"))],
    );
    h.chain.put_receipt(completion_receipt(tx_hash, "nerve-c"));
    h.engine.ingestion().round().await.unwrap();

    h.chain.put_receipt(receipt(tx_hash, 1000, false, vec![]));
    h.chain.set_height(1030);
    h.engine.confirmation().round().await;
    assert_eq!(
        h.engine.unconfirmed().get(&tx_hash).await.unwrap().status,
        TxStatus::Resend
    );

    for expected in 1..=3 {
        h.engine.confirmation().round().await;
        let record = h.engine.unconfirmed().get(&tx_hash).await.unwrap();
        assert_eq!(record.resend_count, expected);
    }

    // resend_max is 3
    h.engine.confirmation().round().await;
    assert!(!h.engine.unconfirmed().contains(&tx_hash).await);
    assert!(h.store.find_unconfirmed(tx_hash).await.unwrap().is_none());
    assert!(h.broadcaster.calls().is_empty());
}

#[tokio::test]
async fn test_stuck_self_broadcast_is_accelerated() {
    let h = Harness::new(member(1), test_config());
    h.engine.start_up().await.unwrap();
    h.chain.set_height(1000);
    h.engine
        .submit_outbound(withdraw_job("nerve-a", vec![member(1), member(2)]))
        .await
        .unwrap();
    let first = sent_hash(1);
    h.chain
        .put_pending(call_to(first, member(1), bridge(), withdraw_call("nerve-a")));

    h.clock.advance_secs(181);
    h.engine.confirmation().round().await;
    assert!(!h.engine.unconfirmed().contains(&first).await);
    let replacement = h.engine.unconfirmed().get(&sent_hash(2)).await.unwrap();
    assert_eq!(replacement.nerve_tx_hash.as_deref(), Some("nerve-a"));
    assert_eq!(replacement.status, TxStatus::Initial);
    assert_eq!(h.broadcaster.calls().len(), 2);
}

#[tokio::test]
async fn test_stuck_broadcast_that_packed_is_not_resent() {
    let h = Harness::new(member(1), test_config());
    h.engine.start_up().await.unwrap();
    h.engine
        .submit_outbound(withdraw_job("nerve-p", vec![member(1), member(2)]))
        .await
        .unwrap();
    let tx_hash = sent_hash(1);
    let mut packed = call_to(tx_hash, member(1), bridge(), withdraw_call("nerve-p"));
    packed.block_height = Some(1000);
    h.chain.put_pending(packed);
    h.chain.set_height(1000);

    h.clock.advance_secs(181);
    h.engine.confirmation().round().await;

    let record = h.engine.unconfirmed().get(&tx_hash).await.unwrap();
    assert_eq!(record.block_height, Some(1000));
    assert_eq!(h.broadcaster.calls().len(), 1);
}

#[tokio::test]
async fn test_height_is_discovered_for_mined_broadcast() {
    let h = Harness::new(member(1), test_config());
    h.engine.start_up().await.unwrap();
    h.engine
        .submit_outbound(withdraw_job("nerve-d", vec![member(1), member(2)]))
        .await
        .unwrap();
    let tx_hash = sent_hash(1);
    assert_eq!(h.engine.unconfirmed().get(&tx_hash).await.unwrap().block_height, None);

    h.chain.put_block(
        1000,
        0,
        vec![call_to(tx_hash, member(1), bridge(), withdraw_call("nerve-d"))],
    );
    h.engine.confirmation().round().await;

    let record = h.engine.unconfirmed().get(&tx_hash).await.unwrap();
    assert_eq!(record.block_height, Some(1000));
    assert_eq!(record.status, TxStatus::Initial);
    let stored = h.store.find_unconfirmed(tx_hash).await.unwrap().unwrap();
    assert_eq!(stored.block_height, Some(1000));
}

#[tokio::test]
async fn test_unknown_broadcast_dropped_once_finalized_elsewhere() {
    let h = Harness::new(member(1), test_config());
    h.engine.start_up().await.unwrap();
    h.engine
        .submit_outbound(withdraw_job("nerve-h", vec![member(1), member(2)]))
        .await
        .unwrap();
    let tx_hash = sent_hash(1);

    // Not on chain, not finalized: sit out two rounds
    h.engine.confirmation().round().await;
    let record = h.engine.unconfirmed().get(&tx_hash).await.unwrap();
    assert_eq!(record.skip_rounds, 2);

    h.home.finalize("nerve-h");
    h.engine.confirmation().round().await;
    h.engine.confirmation().round().await;
    assert!(h.engine.unconfirmed().contains(&tx_hash).await);

    h.engine.confirmation().round().await;
    assert!(!h.engine.unconfirmed().contains(&tx_hash).await);
    assert!(h.store.find_unconfirmed(tx_hash).await.unwrap().is_none());
    assert_eq!(h.broadcaster.calls().len(), 1);
}
