//! Storage services: offers, distribution across offers and offer
//! synchronization, plus the seams they are wired through.

pub mod digest;
pub mod distribution;
pub mod offer;
pub mod offer_registry;
pub mod offset_store;
pub mod staging;
pub mod synchronization;
