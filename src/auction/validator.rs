//! Pure admission check for a proposed bid. No I/O, no clock reads: the
//! caller supplies the snapshot and the current time.

use crate::auction::types::AuctionSnapshot;
use crate::error::BidRejection;

/// Parses user input into a bid amount. Surrounding whitespace and a single
/// leading `$` are tolerated; anything non-finite or negative is not an
/// amount.
pub fn parse_bid_amount(raw: &str) -> Result<f64, BidRejection> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix('$').unwrap_or(trimmed).trim_start();
    if digits.is_empty() {
        return Err(BidRejection::InvalidAmount);
    }

    let amount = digits
        .parse::<f64>()
        .map_err(|_| BidRejection::InvalidAmount)?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(BidRejection::InvalidAmount);
    }

    // Normalize -0.0 so it compares and prints like zero.
    Ok(amount + 0.0)
}

/// Decides whether `raw_amount` may be submitted against `snapshot` at
/// `now_ms`. Returns the normalized amount on acceptance.
///
/// Checks run in a fixed order: loaded, parseable, still open, strictly above
/// the current bid. Ties are rejected.
pub fn validate_bid(
    snapshot: Option<&AuctionSnapshot>,
    raw_amount: &str,
    now_ms: i64,
) -> Result<f64, BidRejection> {
    let snapshot = snapshot.ok_or(BidRejection::NotLoaded)?;
    let amount = parse_bid_amount(raw_amount)?;

    if snapshot.is_ended(now_ms) {
        return Err(BidRejection::AuctionEnded);
    }

    if amount <= snapshot.current_bid {
        return Err(BidRejection::BidTooLow {
            current_bid: snapshot.current_bid,
        });
    }

    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::types::AuctionDocument;

    const NOW: i64 = 1_752_000_000_000;
    const HOUR_MS: i64 = 3_600_000;

    fn snapshot(current_bid: f64, end_time_ms: i64) -> AuctionSnapshot {
        AuctionSnapshot::from_document(
            AuctionDocument {
                id: "auction-001".to_string(),
                title: Some("Fresh Oranges (700kg)".to_string()),
                current_bid: Some(current_bid),
                end_time_ms: Some(end_time_ms),
                ..AuctionDocument::default()
            },
            0.0,
            NOW,
        )
    }

    #[test]
    fn rejects_when_snapshot_not_loaded() {
        assert_eq!(
            validate_bid(None, "1600", NOW),
            Err(BidRejection::NotLoaded)
        );
    }

    #[test]
    fn rejects_non_numeric_input() {
        let open = snapshot(100.0, NOW + HOUR_MS);
        for raw in ["", "   ", "abc", "12abc", "$", "1,000", "NaN", "inf", "-inf"] {
            assert_eq!(
                validate_bid(Some(&open), raw, NOW),
                Err(BidRejection::InvalidAmount),
                "input {raw:?} should be rejected as invalid"
            );
        }
    }

    #[test]
    fn rejects_negative_amounts_as_invalid() {
        let open = snapshot(0.0, NOW + HOUR_MS);
        assert_eq!(
            validate_bid(Some(&open), "-5", NOW),
            Err(BidRejection::InvalidAmount)
        );
    }

    #[test]
    fn rejects_zero_against_zero_floor() {
        let open = snapshot(0.0, NOW + HOUR_MS);
        assert_eq!(
            validate_bid(Some(&open), "0", NOW),
            Err(BidRejection::BidTooLow { current_bid: 0.0 })
        );
        assert_eq!(
            validate_bid(Some(&open), "-0", NOW),
            Err(BidRejection::BidTooLow { current_bid: 0.0 })
        );
    }

    #[test]
    fn tie_with_current_bid_is_rejected() {
        let open = snapshot(1_550.0, NOW + HOUR_MS);
        assert_eq!(
            validate_bid(Some(&open), "1550.00", NOW),
            Err(BidRejection::BidTooLow {
                current_bid: 1_550.0
            })
        );
    }

    #[test]
    fn smallest_increment_above_current_bid_is_accepted() {
        let open = snapshot(1_550.0, NOW + HOUR_MS);
        assert_eq!(validate_bid(Some(&open), "1550.01", NOW), Ok(1_550.01));
        assert_eq!(validate_bid(Some(&open), "1551.00", NOW), Ok(1_551.0));
    }

    #[test]
    fn accepts_currency_prefix_and_whitespace() {
        let open = snapshot(10.0, NOW + HOUR_MS);
        assert_eq!(validate_bid(Some(&open), "  $12.5 ", NOW), Ok(12.5));
    }

    #[test]
    fn validation_at_exact_deadline_is_rejected() {
        let closing = snapshot(100.0, NOW);
        assert_eq!(
            validate_bid(Some(&closing), "200", NOW),
            Err(BidRejection::AuctionEnded)
        );
    }

    #[test]
    fn validation_one_millisecond_before_deadline_is_accepted() {
        let closing = snapshot(100.0, NOW + 1);
        assert_eq!(validate_bid(Some(&closing), "200", NOW), Ok(200.0));
    }

    #[test]
    fn already_ended_auction_rejects_any_bid() {
        let ended = snapshot(100.0, NOW - 1_000);
        for raw in ["101", "1000000", "100"] {
            assert_eq!(
                validate_bid(Some(&ended), raw, NOW),
                Err(BidRejection::AuctionEnded)
            );
        }
    }

    #[test]
    fn unparseable_input_is_reported_before_expiry() {
        let ended = snapshot(100.0, NOW - 1_000);
        assert_eq!(
            validate_bid(Some(&ended), "soon", NOW),
            Err(BidRejection::InvalidAmount)
        );
    }

    #[test]
    fn document_without_deadline_never_accepts_bids() {
        let undated = AuctionSnapshot::from_document(
            AuctionDocument {
                id: "auction-undated".to_string(),
                current_bid: Some(5.0),
                ..AuctionDocument::default()
            },
            0.0,
            NOW,
        );
        assert_eq!(
            validate_bid(Some(&undated), "10", NOW),
            Err(BidRejection::AuctionEnded)
        );
    }

    #[test]
    fn accepts_iff_numeric_above_current_and_before_deadline() {
        let current_bid = 250.0;
        let end_time = NOW + 10_000;
        // Offsets are relative to NOW; the deadline sits at offset 10_000.
        let amounts = [-1.0, 0.0, 249.99, 250.0, 250.01, 251.0, 10_000.0];
        let offsets = [-20_000_i64, -1, 0, 1, 9_999, 10_000, 10_001];

        for amount in amounts {
            for offset in offsets {
                let now = NOW + offset;
                let state = snapshot(current_bid, end_time);
                let raw = format!("{amount}");
                let result = validate_bid(Some(&state), &raw, now);
                let expected = amount >= 0.0 && amount > current_bid && now < end_time;
                assert_eq!(
                    result.is_ok(),
                    expected,
                    "amount {amount} at offset {offset} gave {result:?}"
                );
            }
        }
    }
}
