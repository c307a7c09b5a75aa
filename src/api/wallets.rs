use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ApiState;
use crate::error::{DispatchError, Result};
use crate::model::{Account, EntryKind, WalletLedgerEntry};

fn parse_account(kind: &str, id: Uuid) -> Result<Account> {
    match kind {
        "requester" => Ok(Account::Requester(id)),
        "provider" => Ok(Account::Provider(id)),
        // The id segment is ignored for the singleton accounts.
        "escrow" => Ok(Account::Escrow),
        "platform" => Ok(Account::Platform),
        other => Err(DispatchError::InvalidRequest(format!(
            "unknown wallet kind '{}'",
            other
        ))),
    }
}

#[derive(Serialize)]
pub struct WalletView {
    pub account: Account,
    pub balance_cents: i64,
    pub entries: Vec<WalletLedgerEntry>,
}

pub async fn wallet_handler(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> Result<Json<WalletView>> {
    let account = parse_account(&kind, id)?;
    let balance_cents = state.store.balance(&account).await?;
    let entries = state.store.entries_for_account(&account).await?;

    Ok(Json(WalletView {
        account,
        balance_cents,
        entries,
    }))
}

#[derive(Deserialize)]
pub struct DepositRequest {
    pub amount_cents: i64,
}

/// Fund a requester or provider wallet from outside the system. The
/// matching external leg keeps the whole ledger summing to zero.
pub async fn deposit_handler(
    State(state): State<ApiState>,
    Path((kind, id)): Path<(String, Uuid)>,
    Json(req): Json<DepositRequest>,
) -> Result<Json<WalletView>> {
    let account = parse_account(&kind, id)?;
    if !matches!(account, Account::Requester(_) | Account::Provider(_)) {
        return Err(DispatchError::InvalidRequest(
            "deposits go to requester or provider wallets".to_string(),
        ));
    }
    if req.amount_cents <= 0 {
        return Err(DispatchError::InvalidRequest(format!(
            "deposit amount must be positive, got {}",
            req.amount_cents
        )));
    }

    state
        .store
        .append_entries(vec![
            WalletLedgerEntry::new(account.clone(), req.amount_cents, EntryKind::Deposit, None),
            WalletLedgerEntry::new(Account::External, -req.amount_cents, EntryKind::Deposit, None),
        ])
        .await?;

    tracing::info!(account = %account, amount_cents = req.amount_cents, "Deposit applied");

    let balance_cents = state.store.balance(&account).await?;
    let entries = state.store.entries_for_account(&account).await?;
    Ok(Json(WalletView {
        account,
        balance_cents,
        entries,
    }))
}
