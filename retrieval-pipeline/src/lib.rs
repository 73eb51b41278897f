#![allow(clippy::missing_docs_in_private_items)]

pub mod evidence;
pub mod hybrid;

pub use evidence::{
    AllowAll, Confidence, EvidencePack, EvidencePackBuilder, EvidenceSource, PermissionFilter,
};
pub use hybrid::{HybridSearch, RankedResult};
