//! Fixed-point milliunit helpers for insulin quantities.
//!
//! Pump increments (0.025, 0.05, 0.1 U) are not exactly representable in
//! binary floating point, so quantization is done in integer milliunits
//! (`i64`, 1 mU = 0.001 U) and converted back at the edge.

/// Convert units to integer milliunits, rounding to nearest.
/// Non-finite values map to 0.
#[inline]
pub fn units_to_milli(u: f64) -> i64 {
    if !u.is_finite() {
        return 0;
    }
    (u * 1000.0).round() as i64
}

/// Convert integer milliunits back to units.
#[inline]
pub fn milli_to_units(mu: i64) -> f64 {
    mu as f64 / 1000.0
}

/// Floor `units` to a whole number of pump increments. Amounts below one
/// increment become 0; negative amounts floor toward zero.
#[inline]
pub fn floor_to_increment(units: f64, increment: f64) -> f64 {
    let inc = units_to_milli(increment).max(1);
    let mu = units_to_milli(units);
    milli_to_units((mu / inc) * inc)
}

/// Round `units` to the nearest pump increment.
#[inline]
pub fn round_to_increment(units: f64, increment: f64) -> f64 {
    let inc = units_to_milli(increment).max(1);
    let mu = units_to_milli(units);
    let q = (mu as f64 / inc as f64).round() as i64;
    milli_to_units(q * inc)
}

/// Round `units` to the nearest whole pump pulse.
#[inline]
pub fn round_to_pulses(units: f64, pulses_per_unit: u32) -> f64 {
    let ppu = f64::from(pulses_per_unit.max(1));
    (units * ppu).round() / ppu
}

/// Increment used for accounting delivered insulin: 0.05 when the pump is
/// configured for it, otherwise 0.1.
#[inline]
pub fn accounting_increment(configured: f64) -> f64 {
    if units_to_milli(configured) == 50 {
        0.05
    } else {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_to_increment_drops_partial_steps() {
        assert_eq!(floor_to_increment(0.37, 0.05), 0.35);
        assert_eq!(floor_to_increment(0.04, 0.05), 0.0);
        assert_eq!(floor_to_increment(1.0, 0.1), 1.0);
        assert_eq!(floor_to_increment(0.3, 0.1), 0.3);
    }

    #[test]
    fn round_to_increment_nearest() {
        assert_eq!(round_to_increment(0.37, 0.05), 0.35);
        assert_eq!(round_to_increment(0.38, 0.05), 0.4);
        assert_eq!(round_to_increment(0.025, 0.025), 0.025);
    }

    #[test]
    fn pulses_round_per_generation() {
        assert_eq!(round_to_pulses(0.513, 40), 0.525);
        assert_eq!(round_to_pulses(0.513, 20), 0.5);
    }

    #[test]
    fn accounting_increment_defaults_to_tenth() {
        assert_eq!(accounting_increment(0.05), 0.05);
        assert_eq!(accounting_increment(0.025), 0.1);
        assert_eq!(accounting_increment(0.1), 0.1);
    }

    #[test]
    fn non_finite_is_zero() {
        assert_eq!(units_to_milli(f64::NAN), 0);
        assert_eq!(floor_to_increment(f64::INFINITY, 0.1), 0.0);
    }
}
