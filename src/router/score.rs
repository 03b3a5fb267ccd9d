//! Purchase-time vendor scoring.

use crate::health::ProviderHealth;
use crate::models::{Offer, Vendor};

/// Everything the score formula consumes for one eligible vendor.
#[derive(Debug, Clone)]
pub struct ScoreInputs {
    /// Decayed success rate; `None` scores as 0.5.
    pub success_rate: Option<f64>,
    pub admin_weight: f64,
    pub priority: i64,
    pub stock: i64,
    pub avg_delivery_ms: Option<f64>,
    /// Lowest known offer price for the requested pair, if indexed.
    pub offer_price: Option<f64>,
    pub price_multiplier: f64,
}

impl ScoreInputs {
    pub fn from_parts(vendor: &Vendor, health: &ProviderHealth, offer: Option<&Offer>) -> Self {
        Self {
            success_rate: health.success_rate,
            admin_weight: vendor.weight,
            priority: vendor.priority,
            stock: offer.map(|o| o.stock).unwrap_or(0),
            avg_delivery_ms: health.avg_delivery_ms,
            offer_price: offer.map(|o| o.price),
            price_multiplier: vendor.price_multiplier,
        }
    }
}

/// `score = (successRate x weight x priorityBoost x stockFactor)
///        / (normalizedDeliveryTime x priceFactor)`
pub fn vendor_score(inputs: &ScoreInputs) -> f64 {
    let success_rate = inputs.success_rate.unwrap_or(0.5);
    let priority_boost = 1.0 / inputs.priority.max(1) as f64;
    let stock_factor = if inputs.stock > 0 {
        (inputs.stock as f64 + 10.0).log10()
    } else {
        0.1
    };
    let normalized_delivery = inputs.avg_delivery_ms.unwrap_or(0.0).max(2000.0) / 10_000.0;
    let price_factor = match inputs.offer_price {
        Some(price) => price * inputs.price_multiplier,
        None => inputs.price_multiplier,
    }
    .max(1e-9);

    (success_rate * inputs.admin_weight * priority_boost * stock_factor)
        / (normalized_delivery * price_factor)
}

/// Deterministic ranking: score descending, then priority ascending, then
/// slug.
pub fn sort_ranked<T, F>(candidates: &mut [T], key: F)
where
    F: Fn(&T) -> (f64, i64, String),
{
    candidates.sort_by(|a, b| {
        let (score_a, priority_a, slug_a) = key(a);
        let (score_b, priority_b, slug_b) = key(b);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(priority_a.cmp(&priority_b))
            .then(slug_a.cmp(&slug_b))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> ScoreInputs {
        ScoreInputs {
            success_rate: Some(1.0),
            admin_weight: 1.0,
            priority: 1,
            stock: 100,
            avg_delivery_ms: None,
            offer_price: Some(1.0),
            price_multiplier: 1.0,
        }
    }

    #[test]
    fn unknown_success_rate_scores_as_half() {
        let known = vendor_score(&base_inputs());
        let unknown = vendor_score(&ScoreInputs {
            success_rate: None,
            ..base_inputs()
        });
        assert!((unknown - known * 0.5).abs() < 1e-9);
    }

    #[test]
    fn zero_stock_is_penalized() {
        let stocked = vendor_score(&base_inputs());
        let empty = vendor_score(&ScoreInputs {
            stock: 0,
            ..base_inputs()
        });
        assert!(empty < stocked / 10.0);
    }

    #[test]
    fn lower_priority_wins() {
        let high = vendor_score(&ScoreInputs {
            priority: 1,
            ..base_inputs()
        });
        let low = vendor_score(&ScoreInputs {
            priority: 4,
            ..base_inputs()
        });
        assert!((high / low - 4.0).abs() < 1e-9);
    }

    #[test]
    fn delivery_time_floor_is_two_seconds() {
        let fast = vendor_score(&ScoreInputs {
            avg_delivery_ms: Some(500.0),
            ..base_inputs()
        });
        let floor = vendor_score(&ScoreInputs {
            avg_delivery_ms: Some(2000.0),
            ..base_inputs()
        });
        assert_eq!(fast, floor);
        let slow = vendor_score(&ScoreInputs {
            avg_delivery_ms: Some(8000.0),
            ..base_inputs()
        });
        assert!(slow < floor);
    }

    #[test]
    fn cheaper_offers_score_higher() {
        let cheap = vendor_score(&ScoreInputs {
            offer_price: Some(0.5),
            ..base_inputs()
        });
        let pricey = vendor_score(&ScoreInputs {
            offer_price: Some(2.0),
            ..base_inputs()
        });
        assert!(cheap > pricey);
    }

    #[test]
    fn tie_break_is_priority_then_slug() {
        let mut rows = vec![
            (1.0_f64, 2_i64, "bbb".to_string()),
            (1.0, 1, "zzz".to_string()),
            (1.0, 1, "aaa".to_string()),
            (2.0, 9, "low".to_string()),
        ];
        sort_ranked(&mut rows, |r| (r.0, r.1, r.2.clone()));
        let order: Vec<&str> = rows.iter().map(|r| r.2.as_str()).collect();
        assert_eq!(order, vec!["low", "aaa", "zzz", "bbb"]);
    }
}
