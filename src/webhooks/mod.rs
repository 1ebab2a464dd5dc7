//! Gitea webhook deliveries: signature checks and payload validation.

pub mod payload;
pub mod signature;

pub use payload::{BranchEvent, HEADER_EVENT, PayloadError, parse_branch_event};
pub use signature::{parse_signature_header, sign_payload, verify_signature};
