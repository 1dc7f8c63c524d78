pub mod eligibility;
pub mod ledger;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod store;
pub mod structural;
pub mod submission;
