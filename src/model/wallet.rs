use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Parties money can sit with. `External` is the outside world (deposits
/// enter through it), so every ledger group nets to zero and the whole
/// ledger always sums to zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Account {
    Requester(Uuid),
    Provider(Uuid),
    Escrow,
    Platform,
    External,
}

impl Account {
    /// Wallets that must never go negative. Escrow and Platform only ever
    /// receive what was previously held; External is unbounded.
    pub fn overdraft_protected(&self) -> bool {
        matches!(self, Account::Requester(_) | Account::Provider(_))
    }
}

impl std::fmt::Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Account::Requester(id) => write!(f, "requester:{}", id),
            Account::Provider(id) => write!(f, "provider:{}", id),
            Account::Escrow => write!(f, "escrow"),
            Account::Platform => write!(f, "platform"),
            Account::External => write!(f, "external"),
        }
    }
}

/// What kind of movement a ledger entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deposit,
    Hold,
    Capture,
    Payout,
    Commission,
    Refund,
    Tip,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Deposit => write!(f, "deposit"),
            EntryKind::Hold => write!(f, "hold"),
            EntryKind::Capture => write!(f, "capture"),
            EntryKind::Payout => write!(f, "payout"),
            EntryKind::Commission => write!(f, "commission"),
            EntryKind::Refund => write!(f, "refund"),
            EntryKind::Tip => write!(f, "tip"),
        }
    }
}

/// One signed movement on one account. Balances are the sum of entries;
/// entries are append-only and never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletLedgerEntry {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub account: Account,
    pub amount_cents: i64,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
}

impl WalletLedgerEntry {
    pub fn new(account: Account, amount_cents: i64, kind: EntryKind, job_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            account,
            amount_cents,
            kind,
            created_at: Utc::now(),
        }
    }
}

/// The financial outcome of a completed job. Immutable once written except
/// `tip_cents`, which may be set once within the tip window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub job_id: Uuid,
    pub requester_id: Uuid,
    pub provider_id: Uuid,
    pub gross_cents: i64,
    pub commission_rate: f64,
    pub commission_cents: i64,
    pub worker_net_cents: i64,
    pub tip_cents: Option<i64>,
    pub settled_at: DateTime<Utc>,
}
