pub mod job;
pub mod provider;
pub mod wallet;

pub use job::{CancelParty, JobRequest, JobStatus, ServiceKind};
pub use provider::Provider;
pub use wallet::{Account, EntryKind, SettlementRecord, WalletLedgerEntry};
