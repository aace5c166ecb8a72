#![warn(missing_docs)]

//! MetaCohort replication core: cohort registry, instance event fabric,
//! reference copies, classification lifecycle and federated queries.

pub mod classification;
pub mod config;
pub mod error;
pub mod event;
pub mod fabric;
pub mod home;
pub mod instance;
pub mod locking;
pub mod measure;
pub mod member;
pub mod query;
pub mod refcopy;
pub mod registry;
pub mod storage;
pub mod types;

pub use error::{CohortError, Result};
pub use member::CohortMember;
