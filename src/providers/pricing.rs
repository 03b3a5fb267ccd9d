//! Offer pricing.
//!
//! Prices are computed once, at index time. The displayed price is the
//! charged price; exchange-rate changes only propagate on the next sync.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::models::{NormalizationMode, Vendor};

/// A vendor price converted to canonical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComputedPrice {
    /// Final sell price in points, rounded to 2 decimals.
    pub points: f64,
    /// Base cost in USD, rounded to 4 decimals, kept for audit.
    pub usd: f64,
    /// Raw vendor price, rounded to 6 decimals, kept for audit.
    pub raw: f64,
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

pub fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

fn rate_to_usd(rates: &HashMap<String, f64>, currency: &str) -> Result<f64> {
    let rate = rates
        .get(&currency.to_uppercase())
        .copied()
        .ok_or_else(|| anyhow!("no USD rate for currency {}", currency))?;
    if rate <= 0.0 {
        return Err(anyhow!("non-positive USD rate for currency {}", currency));
    }
    Ok(rate)
}

/// Units of vendor credit per USD, resolved per the vendor's normalization
/// mode. `SMART_AUTO` derives the realized rate from deposit economics and
/// falls back to `AUTO` when the deposits are not both recorded.
pub fn effective_vendor_rate(vendor: &Vendor, rates: &HashMap<String, f64>) -> Result<f64> {
    match vendor.normalization_mode {
        NormalizationMode::Manual => {
            let rate = vendor
                .normalization_rate
                .ok_or_else(|| anyhow!("vendor {} is MANUAL but has no rate", vendor.name))?;
            if rate <= 0.0 {
                return Err(anyhow!("vendor {} has non-positive manual rate", vendor.name));
            }
            Ok(rate)
        }
        NormalizationMode::SmartAuto => {
            match (vendor.deposit_spent, vendor.deposit_received) {
                (Some(spent), Some(received)) if spent > 0.0 && received > 0.0 => {
                    let deposit_currency = vendor
                        .deposit_currency
                        .as_deref()
                        .unwrap_or(vendor.currency.as_str());
                    let usd_spent = spent / rate_to_usd(rates, deposit_currency)?;
                    Ok(received / usd_spent)
                }
                _ => rate_to_usd(rates, &vendor.currency),
            }
        }
        NormalizationMode::Auto => rate_to_usd(rates, &vendor.currency),
    }
}

/// Convert one raw vendor price into the canonical sell price:
/// `sellPoints = baseUsd × pointsRate × priceMultiplier + fixedMarkup × pointsRate`.
pub fn compute_sell_price(
    raw_price: f64,
    vendor: &Vendor,
    rates: &HashMap<String, f64>,
    points_rate: f64,
) -> Result<ComputedPrice> {
    if raw_price < 0.0 {
        return Err(anyhow!("negative raw price from vendor {}", vendor.name));
    }
    let rate = effective_vendor_rate(vendor, rates)?;
    let base_usd = raw_price / rate;
    let points =
        base_usd * points_rate * vendor.price_multiplier + vendor.fixed_markup * points_rate;

    Ok(ComputedPrice {
        points: round2(points),
        usd: round4(base_usd),
        raw: round6(raw_price),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::vendor_fixture;

    fn rates() -> HashMap<String, f64> {
        HashMap::from([("USD".to_string(), 1.0), ("RUB".to_string(), 90.0)])
    }

    #[test]
    fn auto_mode_uses_currency_rate() {
        let mut vendor = vendor_fixture("v1");
        vendor.currency = "RUB".into();
        let price = compute_sell_price(45.0, &vendor, &rates(), 1.0).unwrap();
        assert_eq!(price.usd, 0.5);
        assert_eq!(price.points, 0.5);
    }

    #[test]
    fn manual_mode_uses_admin_rate() {
        let mut vendor = vendor_fixture("v1");
        vendor.normalization_mode = NormalizationMode::Manual;
        vendor.normalization_rate = Some(50.0);
        vendor.currency = "RUB".into();
        let price = compute_sell_price(25.0, &vendor, &rates(), 1.0).unwrap();
        assert_eq!(price.usd, 0.5);
    }

    #[test]
    fn smart_auto_derives_rate_from_deposits() {
        let mut vendor = vendor_fixture("v1");
        vendor.normalization_mode = NormalizationMode::SmartAuto;
        vendor.deposit_currency = Some("RUB".into());
        // 9000 RUB spent = 100 USD; 12000 credits received => 120 credits/USD.
        vendor.deposit_spent = Some(9000.0);
        vendor.deposit_received = Some(12_000.0);
        let price = compute_sell_price(60.0, &vendor, &rates(), 1.0).unwrap();
        assert_eq!(price.usd, 0.5);
    }

    #[test]
    fn smart_auto_without_deposits_falls_back_to_auto() {
        let mut vendor = vendor_fixture("v1");
        vendor.normalization_mode = NormalizationMode::SmartAuto;
        vendor.currency = "RUB".into();
        let price = compute_sell_price(90.0, &vendor, &rates(), 1.0).unwrap();
        assert_eq!(price.usd, 1.0);
    }

    #[test]
    fn multiplier_and_markup_apply_in_points() {
        let mut vendor = vendor_fixture("v1");
        vendor.price_multiplier = 1.5;
        vendor.fixed_markup = 0.10;
        // pointsRate 100: 1 USD = 100 points.
        let price = compute_sell_price(2.0, &vendor, &rates(), 100.0).unwrap();
        // 2 USD * 100 * 1.5 + 0.10 * 100 = 310.
        assert_eq!(price.points, 310.0);
    }

    #[test]
    fn missing_rate_is_an_error() {
        let mut vendor = vendor_fixture("v1");
        vendor.currency = "XYZ".into();
        assert!(compute_sell_price(1.0, &vendor, &rates(), 1.0).is_err());
    }

    #[test]
    fn rounding_policy() {
        assert_eq!(round2(1.006), 1.01);
        assert_eq!(round2(2.344), 2.34);
        assert_eq!(round4(0.123456), 0.1235);
        assert_eq!(round6(0.1234567891), 0.123457);
    }
}
