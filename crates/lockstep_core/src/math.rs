//! Fixed-point helpers for values that must match bit for bit on every peer.
//!
//! The only non-integer quantity in the core is the clock speed multiplier.
//! It is kept in fixed point so that two peers computing
//! `period / speed` get the same result.

use fixed::types::I32F32;

/// Fixed-point number type used for speed multipliers.
pub type Fixed = I32F32;

/// Serde support for fixed-point numbers.
///
/// Serializes fixed-point numbers as their raw bit representation (i64)
/// to preserve exact precision across serialization boundaries.
pub mod fixed_serde {
    use super::Fixed;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a fixed-point number as its raw bit representation.
    pub fn serialize<S>(value: &Fixed, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.to_bits().serialize(serializer)
    }

    /// Deserialize a fixed-point number from its raw bit representation.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Fixed, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bits = i64::deserialize(deserializer)?;
        Ok(Fixed::from_bits(bits))
    }
}

/// Divide a millisecond period by a speed multiplier.
///
/// The result is truncated to whole microseconds and never drops below one.
#[must_use]
pub fn scaled_period_micros(period_ms: u32, speed: Fixed) -> u64 {
    if speed <= Fixed::ZERO {
        return u64::from(period_ms) * 1000;
    }
    let micros = Fixed::from_num(u64::from(period_ms) * 1000);
    match micros.checked_div(speed) {
        Some(scaled) => scaled.to_num::<i64>().max(1) as u64,
        None => i64::MAX as u64,
    }
}
