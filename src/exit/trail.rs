// =============================================================================
// ATR Trailing Stop — ratchet-only trail
// =============================================================================
//
// The trail sits `mult × ATR` behind price and only ever moves toward price:
// up for longs, down for shorts. A wider candidate never replaces a tighter
// existing level.
// =============================================================================

use crate::types::Direction;

/// Trail level `mult × atr` behind `price`, or `None` on unusable input.
pub fn trail_level(direction: Direction, price: f64, atr: f64, mult: f64) -> Option<f64> {
    if direction.is_flat() || !(price.is_finite() && price > 0.0) || !(atr.is_finite() && atr > 0.0) {
        return None;
    }
    Some(price - direction.sign() * mult * atr)
}

/// Tighten `current` toward `candidate`; never loosens.
pub fn ratchet(direction: Direction, current: Option<f64>, candidate: f64) -> f64 {
    match (direction, current) {
        (_, None) => candidate,
        (Direction::Long, Some(level)) => level.max(candidate),
        (Direction::Short, Some(level)) => level.min(candidate),
        (Direction::Flat, Some(level)) => level,
    }
}

/// Price has crossed the trail against the position.
pub fn is_breached(direction: Direction, price: f64, level: f64) -> bool {
    match direction {
        Direction::Long => price <= level,
        Direction::Short => price >= level,
        Direction::Flat => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_sits_behind_price() {
        assert_eq!(trail_level(Direction::Long, 100.0, 2.0, 1.5), Some(97.0));
        assert_eq!(trail_level(Direction::Short, 100.0, 2.0, 1.5), Some(103.0));
        assert_eq!(trail_level(Direction::Long, 100.0, 0.0, 1.5), None);
        assert_eq!(trail_level(Direction::Flat, 100.0, 2.0, 1.5), None);
    }

    #[test]
    fn trail_never_widens() {
        assert_eq!(ratchet(Direction::Long, Some(97.0), 95.0), 97.0);
        assert_eq!(ratchet(Direction::Long, Some(97.0), 98.0), 98.0);
        assert_eq!(ratchet(Direction::Short, Some(103.0), 105.0), 103.0);
        assert_eq!(ratchet(Direction::Short, Some(103.0), 102.0), 102.0);
        assert_eq!(ratchet(Direction::Long, None, 90.0), 90.0);
    }

    #[test]
    fn breach_is_directional() {
        assert!(is_breached(Direction::Long, 96.9, 97.0));
        assert!(!is_breached(Direction::Long, 97.1, 97.0));
        assert!(is_breached(Direction::Short, 103.0, 103.0));
        assert!(!is_breached(Direction::Short, 102.0, 103.0));
    }
}
