//! Admission decisions and the per-client state behind them.

mod filter;
mod key;
mod policy;
mod table;

pub use filter::{spawn_sweeper, AdmissionFilter};
pub use key::{ClientKey, UNKNOWN_CLIENT};
pub use policy::Policy;
pub use table::{AdmissionRecord, AdmissionTable, Decision};
