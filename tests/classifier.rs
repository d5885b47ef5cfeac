//! Transaction classification scenarios

mod common;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol_types::{SolCall, SolEvent};
use common::*;
use vbank_relayer::contracts::bridge::{VirtualBankMultiSig, IERC20};
use vbank_relayer::engine::{BlockContext, Classification};
use vbank_relayer::error::EngineError;
use vbank_relayer::home::AssetInfo;
use vbank_relayer::types::{BroadcastPayload, OutboundJob, TxType};

const HEIGHT: u64 = 1000;

fn block() -> BlockContext {
    BlockContext {
        height: HEIGHT,
        timestamp: 1_700_000_000,
    }
}

#[tokio::test]
async fn test_native_transfer_with_funds_event_is_deposit() {
    let h = Harness::new(member(1), test_config());
    let from = Address::repeat_byte(0x42);
    let hash = B256::repeat_byte(1);
    let event = VirtualBankMultiSig::DepositFunds {
        from,
        amount: U256::from(700u64),
    };
    h.chain.put_receipt(receipt(
        hash,
        HEIGHT,
        true,
        vec![log_from(bridge(), event.encode_log_data())],
    ));

    let outcome = h
        .engine
        .classifier()
        .classify(&native_transfer(hash, from, 700), block())
        .await
        .unwrap();
    assert_eq!(outcome, Classification::Deposit(hash));

    let record = h.engine.unconfirmed().get(&hash).await.unwrap();
    assert_eq!(record.tx_type, TxType::Deposit);
    assert_eq!(record.value, U256::from(700u64));
    assert_eq!(record.block_height, Some(HEIGHT));
    assert!(!record.is_contract_asset);
    assert_eq!(h.home.pending_deposits(), 1);
}

#[tokio::test]
async fn test_native_transfer_without_funds_event_is_rejected() {
    let h = Harness::new(member(1), test_config());
    let from = Address::repeat_byte(0x42);
    let hash = B256::repeat_byte(2);
    h.chain.put_receipt(receipt(hash, HEIGHT, true, vec![]));

    let outcome = h
        .engine
        .classifier()
        .classify(&native_transfer(hash, from, 700), block())
        .await
        .unwrap();
    assert!(matches!(outcome, Classification::Rejected(_)));
    assert!(!h.engine.unconfirmed().contains(&hash).await);
}

#[tokio::test]
async fn test_native_transfer_with_mismatched_event_is_rejected() {
    let h = Harness::new(member(1), test_config());
    let from = Address::repeat_byte(0x42);
    let hash = B256::repeat_byte(3);
    let event = VirtualBankMultiSig::DepositFunds {
        from,
        amount: U256::from(1u64),
    };
    h.chain.put_receipt(receipt(
        hash,
        HEIGHT,
        true,
        vec![log_from(bridge(), event.encode_log_data())],
    ));

    let outcome = h
        .engine
        .classifier()
        .classify(&native_transfer(hash, from, 700), block())
        .await
        .unwrap();
    assert!(matches!(outcome, Classification::Rejected(_)));
}

#[tokio::test]
async fn test_missing_receipt_is_transient() {
    let h = Harness::new(member(1), test_config());
    let hash = B256::repeat_byte(4);
    let err = h
        .engine
        .classifier()
        .classify(&native_transfer(hash, member(7), 1), block())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transient(_)));
}

fn token_deposit(h: &Harness, hash: B256, token: Address, from: Address, amount: u64) -> Vec<u8> {
    let input = VirtualBankMultiSig::crossOutCall {
        to: "home-recipient".to_string(),
        amount: U256::from(amount),
        erc20: token,
    }
    .abi_encode();
    let cross_out = VirtualBankMultiSig::CrossOutFunds {
        from,
        to: "home-recipient".to_string(),
        amount: U256::from(amount),
        erc20: token,
    };
    let transfer = IERC20::Transfer {
        from,
        to: bridge(),
        value: U256::from(amount),
    };
    h.chain.put_receipt(receipt(
        hash,
        HEIGHT,
        true,
        vec![
            log_from(token, transfer.encode_log_data()),
            log_from(bridge(), cross_out.encode_log_data()),
        ],
    ));
    input
}

#[tokio::test]
async fn test_bridge_token_deposit_checks_minter_for_bound_assets() {
    let h = Harness::new(member(1), test_config());
    let token = Address::repeat_byte(0x33);
    let from = Address::repeat_byte(0x42);
    h.home.register_asset(
        token,
        AssetInfo {
            asset_id: 9,
            decimals: 6,
            bound: true,
        },
    );

    let rejected_hash = B256::repeat_byte(5);
    let input = token_deposit(&h, rejected_hash, token, from, 50);
    h.chain.set_minter(false);
    let outcome = h
        .engine
        .classifier()
        .classify(&call_to(rejected_hash, from, bridge(), input), block())
        .await
        .unwrap();
    assert!(matches!(outcome, Classification::Rejected(_)));

    let accepted_hash = B256::repeat_byte(6);
    let input = token_deposit(&h, accepted_hash, token, from, 50);
    h.chain.set_minter(true);
    let outcome = h
        .engine
        .classifier()
        .classify(&call_to(accepted_hash, from, bridge(), input), block())
        .await
        .unwrap();
    assert_eq!(outcome, Classification::Deposit(accepted_hash));

    let record = h.engine.unconfirmed().get(&accepted_hash).await.unwrap();
    assert!(record.is_contract_asset);
    assert_eq!(record.contract_address, Some(token));
    assert_eq!(record.asset_id, 9);
    assert_eq!(record.decimals, 6);
    assert_eq!(record.to.as_deref(), Some("home-recipient"));
}

#[tokio::test]
async fn test_direct_token_transfer_requires_registered_asset() {
    let h = Harness::new(member(1), test_config());
    let token = Address::repeat_byte(0x34);
    let from = Address::repeat_byte(0x42);
    let hash = B256::repeat_byte(7);
    let input = IERC20::transferCall {
        to: bridge(),
        value: U256::from(80u64),
    }
    .abi_encode();
    let transfer = IERC20::Transfer {
        from,
        to: bridge(),
        value: U256::from(80u64),
    };
    h.chain.put_receipt(receipt(
        hash,
        HEIGHT,
        true,
        vec![log_from(token, transfer.encode_log_data())],
    ));
    let tx = call_to(hash, from, token, input);

    assert_eq!(
        h.engine.classifier().classify(&tx, block()).await.unwrap(),
        Classification::Irrelevant
    );

    h.home.register_asset(
        token,
        AssetInfo {
            asset_id: 12,
            decimals: 18,
            bound: false,
        },
    );
    assert_eq!(
        h.engine.classifier().classify(&tx, block()).await.unwrap(),
        Classification::Deposit(hash)
    );
}

#[tokio::test]
async fn test_peer_broadcast_marks_observed_sender() {
    let h = Harness::new(member(2), test_config());
    h.engine.start_up().await.unwrap();
    h.engine
        .submit_outbound(OutboundJob {
            nerve_tx_hash: "nerve-w".to_string(),
            payload: BroadcastPayload::Change {
                adds: vec![member(4)],
                removes: vec![],
                count: 1,
            },
            signatures: Bytes::from(vec![1u8; 65]),
            roster: vec![member(1), member(2), member(3)],
        })
        .await
        .unwrap();

    let hash = B256::repeat_byte(8);
    let input = VirtualBankMultiSig::createOrSignManagerChangeCall {
        txKey: "nerve-w".to_string(),
        adds: vec![member(4)],
        removes: vec![],
        count: 1,
        signatures: Bytes::from(vec![1u8; 65]),
    }
    .abi_encode();
    h.chain.put_receipt(receipt(hash, HEIGHT, true, vec![]));

    let outcome = h
        .engine
        .classifier()
        .classify(&call_to(hash, member(1), bridge(), input), block())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Classification::Broadcast {
            tx_hash: hash,
            tx_type: TxType::Change
        }
    );

    let waiting = h.engine.waiting().get("nerve-w").await.unwrap();
    assert!(waiting.sent_by.contains(&member(1)));
    assert!(waiting.lower_order_member_sent());
}

#[tokio::test]
async fn test_unrelated_transaction_is_irrelevant() {
    let h = Harness::new(member(1), test_config());
    let tx = call_to(
        B256::repeat_byte(9),
        member(5),
        Address::repeat_byte(0x66),
        vec![1, 2, 3, 4],
    );
    assert_eq!(
        h.engine.classifier().classify(&tx, block()).await.unwrap(),
        Classification::Irrelevant
    );
}
