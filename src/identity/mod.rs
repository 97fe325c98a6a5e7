//! Grouping of face and pet detections into persistent identities.
//!
//! Two paths write identities: a full clustering pass over every stored
//! embedding ([`IdentityClusterer`]) and an online nearest-neighbor vote for
//! a single fresh embedding ([`OnlineMatcher`]). The full pass is
//! authoritative and may revise what the online matcher assigned.

pub mod clusterer;
pub mod dbscan;
pub mod matcher;

pub use clusterer::{
    species_key, Assignment, ClusterInput, ClusterReport, ClusterStatus, IdentityClusterer,
    IdentityStore, NewIdentity,
};
pub use dbscan::{dbscan, NOISE};
pub use matcher::{MatchOutcome, MatchQuery, NeighborIdentity, NeighborLookup, OnlineMatcher};
