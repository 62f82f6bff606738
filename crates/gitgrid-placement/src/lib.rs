//! GitGrid replica placement — zone affinity and load scoring.
//!
//! Pure functions that rank storage nodes as replica targets. They make no
//! store calls; the capacity manager gathers nodes and acts on the result.
//!
//! # Components
//!
//! - **`scorer`** — load score, affinity tiers, candidate ranking, and the
//!   least-loaded pick used by the rebalancer

pub mod scorer;

pub use scorer::{AffinityTier, CandidateScore, affinity_tier, least_loaded, load_score, rank_candidates, removal_order};
