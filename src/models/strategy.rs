//! Storage strategies: named, ordered sets of offers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferReference {
    pub id: String,
    /// The referent offer is the preferred source for reads.
    #[serde(default)]
    pub referent: bool,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl OfferReference {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            referent: false,
            enabled: true,
        }
    }

    pub fn referent(mut self) -> Self {
        self.referent = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStrategy {
    pub id: String,
    pub offers: Vec<OfferReference>,
}

impl StorageStrategy {
    pub fn new(id: impl Into<String>, offers: Vec<OfferReference>) -> Self {
        Self {
            id: id.into(),
            offers,
        }
    }

    /// Enabled offer ids, referent first, otherwise in declaration order.
    pub fn enabled_offer_ids(&self) -> Vec<String> {
        let mut enabled: Vec<&OfferReference> =
            self.offers.iter().filter(|offer| offer.enabled).collect();
        enabled.sort_by_key(|offer| !offer.referent);
        enabled.into_iter().map(|offer| offer.id.clone()).collect()
    }

    pub fn is_offer_enabled(&self, offer_id: &str) -> bool {
        self.offers
            .iter()
            .any(|offer| offer.enabled && offer.id == offer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referent_comes_first_and_disabled_offers_drop_out() {
        let strategy = StorageStrategy::new(
            "default",
            vec![
                OfferReference::new("a"),
                OfferReference::new("b").disabled(),
                OfferReference::new("c").referent(),
                OfferReference::new("d"),
            ],
        );
        assert_eq!(strategy.enabled_offer_ids(), vec!["c", "a", "d"]);
        assert!(!strategy.is_offer_enabled("b"));
        assert!(strategy.is_offer_enabled("d"));
    }
}
