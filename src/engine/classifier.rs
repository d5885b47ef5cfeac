//! Transaction classifier
//!
//! Decides, first match wins:
//! 1. a hash already tracked, or one this node broadcast itself
//! 2. a deposit call on the bridge → deposit, checked against the deposit event
//! 3. a plain native transfer to the bridge → deposit, checked against the funds event
//! 4. a registered token transferred to the bridge → deposit, checked against the transfer log
//! 5. a committee call on the bridge → outbound broadcast
//!
//! Deposits of bound assets also require the token to be a registered minter
//! on the bridge. Anything else is irrelevant.

use alloy::primitives::{Address, B256, U256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::unconfirmed::UnconfirmedTxStore;
use super::waiting::WaitingTxStore;
use super::EngineContext;
use crate::chain::BroadcastCall;
use crate::error::EngineError;
use crate::home::{AssetInfo, DepositSubmission};
use crate::metrics;
use crate::types::{ExternalTx, TxReceipt, TxStatus, TxType, UnconfirmedTxRecord};

/// Outcome of classifying one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Irrelevant,
    Deposit(B256),
    Broadcast { tx_hash: B256, tx_type: TxType },
    /// Matched a deposit shape but failed validation
    Rejected(String),
}

/// Block context of a transaction being classified
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub height: u64,
    /// Unix seconds
    pub timestamp: u64,
}

/// Facts of a validated deposit before asset lookup
struct DepositMatch {
    from: Address,
    amount: U256,
    token: Option<Address>,
    home_address: Option<String>,
}

pub struct TxClassifier {
    ctx: Arc<EngineContext>,
    unconfirmed: Arc<UnconfirmedTxStore>,
    waiting: Arc<WaitingTxStore>,
}

impl TxClassifier {
    pub fn new(
        ctx: Arc<EngineContext>,
        unconfirmed: Arc<UnconfirmedTxStore>,
        waiting: Arc<WaitingTxStore>,
    ) -> Self {
        Self {
            ctx,
            unconfirmed,
            waiting,
        }
    }

    pub async fn classify(
        &self,
        tx: &ExternalTx,
        block: BlockContext,
    ) -> Result<Classification, EngineError> {
        let capability = &self.ctx.capability;
        let bridge = capability.bridge_address();

        // 1. Already tracked
        if let Some(existing) = self.unconfirmed.get(&tx.hash).await {
            if existing.tx_type == TxType::Deposit {
                self.refresh_deposit_position(existing, block).await?;
                return Ok(Classification::Deposit(tx.hash));
            }
            let call = capability.decode_broadcast(&tx.input).unwrap_or(BroadcastCall {
                tx_type: existing.tx_type,
                nerve_tx_hash: existing.nerve_tx_hash.clone().unwrap_or_default(),
            });
            return self.track_broadcast(tx, block, call).await;
        }
        if let Some(nerve_tx_hash) = self.ctx.store.nerve_by_external(tx.hash).await? {
            let call = capability
                .decode_broadcast(&tx.input)
                .unwrap_or(BroadcastCall {
                    tx_type: self
                        .waiting
                        .get(&nerve_tx_hash)
                        .await
                        .map(|w| w.tx_type)
                        .unwrap_or(TxType::Withdraw),
                    nerve_tx_hash,
                });
            return self.track_broadcast(tx, block, call).await;
        }

        let Some(to) = tx.to else {
            return Ok(Classification::Irrelevant);
        };

        if to == bridge {
            // 2. Deposit through the bridge contract
            if let Some(call) = capability.decode_bridge_deposit(&tx.input) {
                let receipt = self.receipt(tx.hash).await?;
                let found = match self.validate_bridge_deposit(tx, &call, &receipt) {
                    Ok(found) => found,
                    Err(reason) => return Ok(self.reject(tx.hash, reason)),
                };
                return self.track_deposit(tx, block, found).await;
            }

            // 3. Plain native transfer
            if tx.input.is_empty() && tx.value > U256::ZERO {
                let receipt = self.receipt(tx.hash).await?;
                if !receipt.success {
                    return Ok(self.reject(tx.hash, "native transfer reverted".to_string()));
                }
                let Some(event) = capability.native_funds_event(&receipt) else {
                    return Ok(self.reject(tx.hash, "missing funds received event".to_string()));
                };
                if event.from != tx.from || event.amount != tx.value {
                    return Ok(self.reject(
                        tx.hash,
                        format!(
                            "funds event mismatch: from {} amount {}",
                            event.from, event.amount
                        ),
                    ));
                }
                let found = DepositMatch {
                    from: tx.from,
                    amount: tx.value,
                    token: None,
                    home_address: None,
                };
                return self.track_deposit(tx, block, found).await;
            }

            // 5. Committee broadcast
            if let Some(call) = capability.decode_broadcast(&tx.input) {
                return self.track_broadcast(tx, block, call).await;
            }

            return Ok(Classification::Irrelevant);
        }

        // 4. Token transfer into the bridge
        if let Some((recipient, amount)) = capability.decode_token_transfer(&tx.input) {
            if recipient != bridge {
                return Ok(Classification::Irrelevant);
            }
            if self.ctx.home.asset_info(Some(to)).await?.is_none() {
                debug!(token = %to, tx_hash = %tx.hash, "Transfer of unregistered token to bridge");
                return Ok(Classification::Irrelevant);
            }
            let receipt = self.receipt(tx.hash).await?;
            if !receipt.success {
                return Ok(self.reject(tx.hash, "token transfer reverted".to_string()));
            }
            let moved = capability.token_transfer_event(&receipt, to, tx.from, bridge);
            if moved != Some(amount) {
                return Ok(self.reject(
                    tx.hash,
                    format!("transfer log mismatch: expected {} got {:?}", amount, moved),
                ));
            }
            let found = DepositMatch {
                from: tx.from,
                amount,
                token: Some(to),
                home_address: None,
            };
            return self.track_deposit(tx, block, found).await;
        }

        Ok(Classification::Irrelevant)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<TxReceipt, EngineError> {
        self.ctx
            .rpc
            .receipt_by_hash(tx_hash)
            .await?
            .ok_or_else(|| EngineError::Transient(format!("receipt not available for {}", tx_hash)))
    }

    fn reject(&self, tx_hash: B256, reason: String) -> Classification {
        error!(tx_hash = %tx_hash, reason = %reason, "Invalid deposit rejected");
        metrics::RECORDS_DROPPED
            .with_label_values(&[self.ctx.chain(), TxType::Deposit.as_str()])
            .inc();
        Classification::Rejected(reason)
    }

    fn validate_bridge_deposit(
        &self,
        tx: &ExternalTx,
        call: &crate::chain::DepositCall,
        receipt: &TxReceipt,
    ) -> Result<DepositMatch, String> {
        if !receipt.success {
            return Err("deposit reverted".to_string());
        }
        let event = self
            .ctx
            .capability
            .bridge_deposit_event(receipt)
            .ok_or_else(|| "missing deposit event".to_string())?;

        if event.from != tx.from {
            return Err(format!("deposit event from {} != sender {}", event.from, tx.from));
        }
        if event.amount != call.amount || event.erc20 != call.erc20 {
            return Err(format!(
                "deposit event amount {} does not match call amount {}",
                event.amount, call.amount
            ));
        }

        match call.erc20 {
            None => {
                if tx.value != call.amount {
                    return Err(format!(
                        "native deposit value {} != declared amount {}",
                        tx.value, call.amount
                    ));
                }
            }
            Some(token) => {
                let bridge = self.ctx.capability.bridge_address();
                let moved = self
                    .ctx
                    .capability
                    .token_transfer_event(receipt, token, tx.from, bridge);
                if moved != Some(call.amount) {
                    return Err(format!("token transfer log mismatch: {:?}", moved));
                }
            }
        }

        Ok(DepositMatch {
            from: tx.from,
            amount: call.amount,
            token: call.erc20,
            home_address: Some(call.home_address.clone()),
        })
    }

    async fn asset_for(&self, token: Option<Address>) -> Result<Option<AssetInfo>, EngineError> {
        match token {
            None => Ok(Some(AssetInfo {
                asset_id: self.ctx.native.asset_id,
                decimals: self.ctx.native.decimals,
                bound: false,
            })),
            Some(token) => self.ctx.home.asset_info(Some(token)).await,
        }
    }

    async fn is_registered_minter(&self, token: Address) -> Result<bool, EngineError> {
        let capability = &self.ctx.capability;
        let data = self
            .ctx
            .rpc
            .call_view(capability.bridge_address(), capability.minter_query(token))
            .await?;
        capability.decode_minter_result(&data)
    }

    async fn track_deposit(
        &self,
        tx: &ExternalTx,
        block: BlockContext,
        found: DepositMatch,
    ) -> Result<Classification, EngineError> {
        let Some(asset) = self.asset_for(found.token).await? else {
            return Ok(self.reject(tx.hash, "asset not registered on home chain".to_string()));
        };
        if let Some(token) = found.token {
            if asset.bound && !self.is_registered_minter(token).await? {
                return Ok(self.reject(
                    tx.hash,
                    format!("bound token {} is not a registered minter", token),
                ));
            }
        }

        let mut record =
            UnconfirmedTxRecord::new(tx.hash, TxType::Deposit, found.from, self.ctx.now());
        record.block_height = Some(block.height);
        record.tx_time = Some(block.timestamp);
        record.to = found.home_address;
        record.value = found.amount;
        record.decimals = asset.decimals;
        record.is_contract_asset = found.token.is_some();
        record.contract_address = found.token;
        record.asset_id = asset.asset_id;

        let submission = deposit_submission(&self.ctx, &record);
        if self.unconfirmed.insert_new(record).await? {
            info!(
                tx_hash = %tx.hash,
                height = block.height,
                amount = %found.amount,
                token = ?found.token,
                "Deposit detected"
            );
            metrics::DEPOSITS_DETECTED
                .with_label_values(&[self.ctx.chain()])
                .inc();
            if let Err(e) = self.ctx.home.pending_deposit(&submission).await {
                debug!(tx_hash = %tx.hash, error = %e, "Pending deposit notice failed");
            }
        }
        Ok(Classification::Deposit(tx.hash))
    }

    /// A tracked deposit seen again, e.g. after a rollback re-included it
    async fn refresh_deposit_position(
        &self,
        mut existing: UnconfirmedTxRecord,
        block: BlockContext,
    ) -> Result<(), EngineError> {
        let _guard = self.unconfirmed.lock(&existing.external_tx_hash).await;
        if existing.delete_flag || existing.block_height == Some(block.height) {
            return Ok(());
        }
        existing.block_height = Some(block.height);
        existing.tx_time = Some(block.timestamp);
        self.unconfirmed.update(&existing).await
    }

    async fn track_broadcast(
        &self,
        tx: &ExternalTx,
        block: BlockContext,
        call: BroadcastCall,
    ) -> Result<Classification, EngineError> {
        let receipt = self.receipt(tx.hash).await?;
        let waiting = self.waiting.get(&call.nerve_tx_hash).await;
        // Recovery executes as a manager change; the waiting job knows the real type
        let tx_type = waiting.as_ref().map(|w| w.tx_type).unwrap_or(call.tx_type);

        let (status, signers) = if !receipt.success {
            (TxStatus::Failed, Vec::new())
        } else {
            match self
                .ctx
                .capability
                .completion_signers(&receipt, tx_type, &call.nerve_tx_hash)
            {
                Some(signers) => (TxStatus::Completed, signers),
                None => (TxStatus::Doing, Vec::new()),
            }
        };

        let is_new = {
            let _guard = self.unconfirmed.lock(&tx.hash).await;
            match self.unconfirmed.get(&tx.hash).await {
                Some(mut existing) => {
                    if existing.delete_flag {
                        return Ok(Classification::Broadcast {
                            tx_hash: tx.hash,
                            tx_type,
                        });
                    }
                    existing.block_height = Some(block.height);
                    existing.tx_time = Some(block.timestamp);
                    existing.nerve_tx_hash = Some(call.nerve_tx_hash.clone());
                    existing.tx_type = tx_type;
                    existing.signers = signers.clone();
                    if let Err(e) = existing.set_status(status) {
                        warn!(tx_hash = %tx.hash, error = %e, "Keeping previous status");
                    }
                    self.unconfirmed.update(&existing).await?;
                    false
                }
                None => {
                    let mut record =
                        UnconfirmedTxRecord::new(tx.hash, tx_type, tx.from, self.ctx.now());
                    record.nerve_tx_hash = Some(call.nerve_tx_hash.clone());
                    record.block_height = Some(block.height);
                    record.tx_time = Some(block.timestamp);
                    record.status = status;
                    record.signers = signers;
                    self.unconfirmed.insert_new(record).await?
                }
            }
        };

        let me = self.ctx.broadcaster.sender_address();
        if status != TxStatus::Failed {
            self.waiting
                .mark_observed_sender(&call.nerve_tx_hash, tx.from, tx.from == me)
                .await?;
        }

        if is_new && tx_type == TxType::Withdraw {
            if let Err(e) = self
                .ctx
                .home
                .pending_withdraw(&call.nerve_tx_hash, tx.hash)
                .await
            {
                debug!(tx_hash = %tx.hash, error = %e, "Pending withdraw notice failed");
            }
        }

        metrics::BROADCASTS_OBSERVED
            .with_label_values(&[self.ctx.chain(), tx_type.as_str()])
            .inc();
        debug!(
            tx_hash = %tx.hash,
            nerve_tx_hash = %call.nerve_tx_hash,
            status = %status,
            "Outbound broadcast observed"
        );

        Ok(Classification::Broadcast {
            tx_hash: tx.hash,
            tx_type,
        })
    }
}

/// Home-chain view of a deposit record
pub fn deposit_submission(ctx: &EngineContext, record: &UnconfirmedTxRecord) -> DepositSubmission {
    let capability = &ctx.capability;
    DepositSubmission {
        external_tx_hash: record.external_tx_hash,
        height: record.block_height.unwrap_or_default(),
        from: capability.format_address(&record.from),
        to: record
            .to
            .clone()
            .unwrap_or_else(|| capability.format_address(&record.from)),
        value: record.value,
        tx_time: record.tx_time.unwrap_or_default(),
        decimals: record.decimals,
        is_contract_asset: record.is_contract_asset,
        contract_address: record
            .contract_address
            .as_ref()
            .map(|a| capability.format_address(a)),
        asset_id: record.asset_id,
    }
}
