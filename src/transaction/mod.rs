// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Groups detail and aggregate writes into one atomic unit. Changes are staged
// per transaction and applied by the store at commit; nothing is visible
// before that.
//
// Design Patterns Used:
// - State Pattern: Transaction state management (Active, Committed, Aborted)
// - Command Pattern: Staged changes with an undo log for rollback
//
// ============================================================================

pub mod change;
pub mod manager;
pub mod scope;
pub mod state;

pub use change::{Change, OnConflict};
pub use manager::{TransactionInfo, TransactionManager, TransactionStats};
pub use scope::within_transaction;
pub use state::{Transaction, TransactionId, TransactionState};
