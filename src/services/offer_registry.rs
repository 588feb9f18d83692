//! Lookup of offers by id and of storage strategies by name.

use crate::{
    errors::{StorageError, StorageResult},
    models::strategy::StorageStrategy,
    services::offer::Offer,
};
use std::{collections::HashMap, sync::Arc};

/// Every offer the process can reach, keyed by id.
#[derive(Default, Clone)]
pub struct OfferRegistry {
    offers: HashMap<String, Arc<dyn Offer>>,
    order: Vec<String>,
}

impl OfferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, offer: Arc<dyn Offer>) {
        let id = offer.id().to_string();
        if self.offers.insert(id.clone(), offer).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, offer_id: &str) -> StorageResult<Arc<dyn Offer>> {
        self.offers
            .get(offer_id)
            .cloned()
            .ok_or_else(|| StorageError::OfferNotFound(offer_id.to_string()))
    }

    /// Offers in registration order.
    pub fn offers(&self) -> impl Iterator<Item = &Arc<dyn Offer>> {
        self.order.iter().filter_map(|id| self.offers.get(id))
    }
}

/// Resolves a strategy id to its offers.
pub trait StrategyProvider: Send + Sync {
    fn strategy(&self, strategy_id: &str) -> StorageResult<StorageStrategy>;
}

/// Strategies fixed at startup.
#[derive(Debug, Default, Clone)]
pub struct StaticStrategyProvider {
    strategies: HashMap<String, StorageStrategy>,
}

impl StaticStrategyProvider {
    pub fn new(strategies: impl IntoIterator<Item = StorageStrategy>) -> Self {
        Self {
            strategies: strategies
                .into_iter()
                .map(|strategy| (strategy.id.clone(), strategy))
                .collect(),
        }
    }
}

impl StrategyProvider for StaticStrategyProvider {
    fn strategy(&self, strategy_id: &str) -> StorageResult<StorageStrategy> {
        self.strategies
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| StorageError::StrategyNotFound(strategy_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::ErrorKind, models::strategy::OfferReference};

    #[test]
    fn unknown_strategy_is_not_found() {
        let provider = StaticStrategyProvider::new([StorageStrategy::new(
            "default",
            vec![OfferReference::new("a").referent()],
        )]);
        assert_eq!(provider.strategy("default").unwrap().offers.len(), 1);
        let err = provider.strategy("cold").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn unknown_offer_is_not_found() {
        let registry = OfferRegistry::new();
        let err = registry.get("ghost").err().unwrap();
        assert!(matches!(err, StorageError::OfferNotFound(_)));
    }
}
