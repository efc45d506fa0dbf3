use rust_decimal::{Decimal, RoundingStrategy};

use crate::types::{IncrementTier, PremiumTier};

/// House increment table used when neither the auction nor the lot supplies
/// one: $5 steps under $100, $10 to $500, $25 beyond.
pub fn default_increment_tiers() -> Vec<IncrementTier> {
    vec![
        IncrementTier {
            min: Decimal::ZERO,
            max: Some(Decimal::from(100)),
            step: Decimal::from(5),
        },
        IncrementTier {
            min: Decimal::from(100),
            max: Some(Decimal::from(500)),
            step: Decimal::from(10),
        },
        IncrementTier {
            min: Decimal::from(500),
            max: None,
            step: Decimal::from(25),
        },
    ]
}

/// Bid step at the given price. Tiers are evaluated in list order and the
/// first band with `min <= current < max` wins; a price past every band
/// falls back to the last step so the function stays total.
pub fn increment(current: Decimal, rules: &[IncrementTier]) -> Decimal {
    for tier in rules {
        let below_max = tier.max.map_or(true, |max| current < max);
        if current >= tier.min && below_max {
            return tier.step;
        }
    }
    rules.last().map_or(Decimal::ONE, |tier| tier.step)
}

/// Smallest acceptable next bid: the starting bid while the lot has no bids,
/// otherwise the current bid plus its tier step.
pub fn min_next_bid(current: Decimal, starting: Decimal, rules: &[IncrementTier]) -> Decimal {
    if current.is_zero() {
        starting
    } else {
        current + increment(current, rules)
    }
}

/// Buyer's premium rate for a winning amount. Exactly one tier applies; an
/// amount outside every band carries no premium.
pub fn premium_rate(amount: Decimal, rules: &[PremiumTier]) -> Decimal {
    for tier in rules {
        let below_max = tier.max.map_or(true, |max| amount < max);
        if amount >= tier.min && below_max {
            return tier.rate;
        }
    }
    Decimal::ZERO
}

/// Buyer's premium for a winning amount. The result is unrounded; callers
/// settle to cents with [`round_cents`].
pub fn premium(amount: Decimal, rules: &[PremiumTier]) -> Decimal {
    amount * premium_rate(amount, rules)
}

/// Half-up rounding to cents, applied to every monetary figure after
/// multiplication.
pub fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "heic"];

/// Extract `(lot_number, photo_order)` from an uploaded image filename.
///
/// After stripping a known image extension (case-insensitive), the stem is
/// matched against, in order: `N-M`, `lot[_-]?N[_-]M` (case-insensitive),
/// `N_M`, `N.M`. The first full match wins; anything else yields `None`.
pub fn parse_image_filename(name: &str) -> Option<(u32, u32)> {
    let stem = strip_image_extension(name);
    digit_pair(stem, '-')
        .or_else(|| lot_prefixed_pair(stem))
        .or_else(|| digit_pair(stem, '_'))
        .or_else(|| digit_pair(stem, '.'))
}

fn strip_image_extension(name: &str) -> &str {
    if let Some(idx) = name.rfind('.') {
        let ext = &name[idx + 1..];
        if IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)) {
            return &name[..idx];
        }
    }
    name
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn digit_pair(stem: &str, sep: char) -> Option<(u32, u32)> {
    let (lot, order) = stem.split_once(sep)?;
    Some((parse_digits(lot)?, parse_digits(order)?))
}

fn lot_prefixed_pair(stem: &str) -> Option<(u32, u32)> {
    if !stem.get(..3)?.eq_ignore_ascii_case("lot") {
        return None;
    }
    let rest = &stem[3..];
    let rest = rest.strip_prefix(['_', '-']).unwrap_or(rest);
    let sep = rest.find(['_', '-'])?;
    let (lot, order) = (&rest[..sep], &rest[sep + 1..]);
    Some((parse_digits(lot)?, parse_digits(order)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_bid_floor_is_the_starting_bid() {
        let rules = default_increment_tiers();
        let floor = min_next_bid(Decimal::ZERO, Decimal::from(100), &rules);
        assert_eq!(floor, Decimal::from(100));
    }

    #[test]
    fn floor_uses_the_tier_of_the_current_bid() {
        let rules = default_increment_tiers();
        assert_eq!(
            min_next_bid(Decimal::from(50), Decimal::from(10), &rules),
            Decimal::from(55)
        );
        // 100 sits on the boundary: the 100-500 band applies.
        assert_eq!(
            min_next_bid(Decimal::from(100), Decimal::from(10), &rules),
            Decimal::from(110)
        );
        assert_eq!(
            min_next_bid(Decimal::from(750), Decimal::from(10), &rules),
            Decimal::from(775)
        );
    }

    #[test]
    fn increment_falls_back_to_last_tier_past_every_band() {
        let rules = vec![IncrementTier {
            min: Decimal::from(10),
            max: Some(Decimal::from(20)),
            step: Decimal::from(2),
        }];
        assert_eq!(increment(Decimal::from(500), &rules), Decimal::from(2));
        assert_eq!(increment(Decimal::from(5), &rules), Decimal::from(2));
    }

    #[test]
    fn premium_applies_a_single_tier() {
        let rules = vec![
            PremiumTier {
                min: Decimal::ZERO,
                max: Some(Decimal::from(1000)),
                rate: Decimal::new(15, 2),
            },
            PremiumTier {
                min: Decimal::from(1000),
                max: None,
                rate: Decimal::new(10, 2),
            },
        ];
        assert_eq!(premium(Decimal::from(100), &rules), Decimal::from(15));
        assert_eq!(premium(Decimal::from(2000), &rules), Decimal::from(200));
    }

    #[test]
    fn rounding_is_half_up_to_cents() {
        assert_eq!(round_cents(Decimal::new(375825, 4)), Decimal::new(3758, 2));
        assert_eq!(round_cents(Decimal::new(125, 3)), Decimal::new(13, 2));
        assert_eq!(round_cents(Decimal::new(124, 3)), Decimal::new(12, 2));
    }

    #[test]
    fn filename_patterns_match_in_order() {
        assert_eq!(parse_image_filename("12-1.jpg"), Some((12, 1)));
        assert_eq!(parse_image_filename("lot_12_2.PNG"), Some((12, 2)));
        assert_eq!(parse_image_filename("LOT-12-2.png"), Some((12, 2)));
        assert_eq!(parse_image_filename("lot12_2.png"), Some((12, 2)));
        assert_eq!(parse_image_filename("12_3.webp"), Some((12, 3)));
        assert_eq!(parse_image_filename("12.3.webp"), Some((12, 3)));
        assert_eq!(parse_image_filename("007-2.HEIC"), Some((7, 2)));
    }

    #[test]
    fn unparseable_filenames_yield_nothing() {
        assert_eq!(parse_image_filename("foo.jpg"), None);
        assert_eq!(parse_image_filename("12.jpg"), None);
        assert_eq!(parse_image_filename("12-1-3.jpg"), None);
        assert_eq!(parse_image_filename("lot_12.jpg"), None);
        assert_eq!(parse_image_filename("12-1.tiff"), None);
        assert_eq!(parse_image_filename(""), None);
    }

    #[test]
    fn unknown_extension_is_not_stripped() {
        // "12.3" would parse, but ".doc" is not an image extension so the
        // stem stays "12.3.doc" and no pattern matches.
        assert_eq!(parse_image_filename("12.3.doc"), None);
    }

    proptest! {
        #[test]
        fn accepted_formats_round_trip(lot in 0u32..100_000, order in 0u32..1_000) {
            let formats = [
                format!("{lot}-{order}.jpg"),
                format!("lot_{lot}_{order}.jpeg"),
                format!("lot-{lot}-{order}.png"),
                format!("{lot}_{order}.gif"),
                format!("{lot}.{order}.webp"),
            ];
            for name in formats {
                prop_assert_eq!(parse_image_filename(&name), Some((lot, order)));
            }
        }

        #[test]
        fn min_next_bid_exceeds_current_once_bidding_started(
            current in 1u32..1_000_000,
            starting in 0u32..1_000,
        ) {
            let rules = default_increment_tiers();
            let current = Decimal::from(current);
            let floor = min_next_bid(current, Decimal::from(starting), &rules);
            prop_assert!(floor > current);
        }
    }
}
