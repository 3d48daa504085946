//! Probability and EV math on decimal odds.
//!
//! All functions take decimal odds. Callers guarantee odds > 1.0 (the
//! snapshot invariant); `de_vig` still refuses anything else rather than
//! produce a division by zero or a negative probability.

/// Raw implied probability of a decimal price.
pub fn implied_probability(odds: f64) -> f64 {
    1.0 / odds
}

/// Sum of implied probabilities. Above 1 is the book's margin, below 1
/// is an arbitrage.
pub fn overround(odds: &[f64]) -> f64 {
    odds.iter().map(|o| implied_probability(*o)).sum()
}

/// Proportional (multiplicative) vig removal:
/// `p_i = (1/o_i) / Σ(1/o_j)`. Returns `None` for an empty slice or any
/// price that is not a finite number above 1.
pub fn de_vig(odds: &[f64]) -> Option<Vec<f64>> {
    if odds.is_empty() || odds.iter().any(|o| !o.is_finite() || *o <= 1.0) {
        return None;
    }
    let total = overround(odds);
    Some(odds.iter().map(|o| implied_probability(*o) / total).collect())
}

/// Expected value per unit stake: `p * (o - 1) - (1 - p)`.
pub fn expected_value(probability: f64, odds: f64) -> f64 {
    probability * (odds - 1.0) - (1.0 - probability)
}

/// True iff backing every outcome at these prices guarantees a profit.
/// Exactly 1 is not an arbitrage.
pub fn is_arbitrage(odds: &[f64]) -> bool {
    !odds.is_empty() && overround(odds) < 1.0
}

pub fn is_two_way_arbitrage(o1: f64, o2: f64) -> bool {
    is_arbitrage(&[o1, o2])
}
