//! Civic token ledger core.
//!
//! Governments issue tokens to citizens under a daily cap, citizens spend
//! them on approved social projects within allocation limits, and project
//! owners convert received tokens to fiat through a reviewed payout flow.
//! Every balance change is an entry in a hash-chained append-only ledger,
//! committed atomically with the records it affects.

#![deny(unsafe_code)]

pub mod allocation;
pub mod clock;
pub mod conversion;
pub mod documents;
pub mod error;
pub mod flow;
pub mod ledger;
pub mod notify;
pub mod policy;
pub mod project;
pub mod reconcile;
pub mod requests;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod types;

pub use allocation::{AllocationLimit, AllocationStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conversion::{
    BankDetails, ConversionDraft, ConversionRequest, PaymentDetails, PayoutConfirmation,
};
pub use documents::{DocumentPolicy, ProofDocument};
pub use error::{ErrorCategory, LedgerError, StorageError};
pub use flow::{ConversionStatus, ProjectStatus, ReviewStatus};
pub use ledger::{AppendOnlyLedger, Direction, EntryStatus, LedgerEntry, TransactionType};
pub use notify::{
    NoopNotificationSink, NotificationError, NotificationEvent, NotificationIntent,
    NotificationSink,
};
pub use policy::{ConversionEscrow, SpendCapPolicy};
pub use project::{NewProject, Project, ProjectSummary};
pub use reconcile::ReconciliationReport;
pub use requests::{
    ClaimSubmission, FundRequest, FundRequestSubmission, RequestKind, ReviewDecision, ReviewState,
    TokenClaim, TokenRequest, TokenRequestSubmission,
};
pub use runtime::{
    CivicLedger, IssueCommand, LedgerConfig, LedgerQuery, ProjectApproval, SupportReceipt,
};
pub use storage::{LedgerRepository, LedgerStorageConfig, MemoryRepository, PostgresRepository};
pub use types::{Account, AccountProfile, Actor, CallContext, IdempotencyKey, UserType};
