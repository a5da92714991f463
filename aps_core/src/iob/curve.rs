//! Insulin activity curves.
//!
//! Both families are expressed per unit of insulin as a function of minutes
//! since delivery: `iob_fraction` is the share still on board, `activity` is
//! the share absorbed per minute at that instant.

use crate::config::{CurveKind, InsulinCfg};

/// Reference action profile the bilinear curve is scaled from.
const BILINEAR_DIA_HOURS: f64 = 3.0;
const BILINEAR_PEAK_MIN: f64 = 75.0;
const BILINEAR_END_MIN: f64 = 180.0;

/// Precomputed curve parameters for a given insulin configuration.
#[derive(Debug, Clone, Copy)]
pub struct ActivityCurve {
    kind: CurveKind,
    dia_hours: f64,
    end: f64,
    // exponential shape, unused for bilinear
    tau: f64,
    a: f64,
    s: f64,
}

impl ActivityCurve {
    pub fn new(cfg: &InsulinCfg) -> Self {
        let end = cfg.dia_minutes().max(1.0);
        // tau is only defined for peak < end / 2
        let peak = cfg.peak_minutes().min(end / 2.0 - 1.0).max(1.0);
        let tau = peak * (1.0 - peak / end) / (1.0 - 2.0 * peak / end);
        let a = 2.0 * tau / end;
        let s = 1.0 / (1.0 - a + (1.0 + a) * (-end / tau).exp());
        Self {
            kind: cfg.curve,
            dia_hours: cfg.dia_hours,
            end,
            tau,
            a,
            s,
        }
    }

    /// Duration of action in minutes.
    #[inline]
    pub fn end_minutes(&self) -> f64 {
        self.end
    }

    /// Fraction of a dose still on board `t` minutes after delivery.
    pub fn iob_fraction(&self, t: f64) -> f64 {
        if t.is_nan() || t < 0.0 {
            return 0.0;
        }
        match self.kind {
            CurveKind::Bilinear => self.bilinear(t).0,
            CurveKind::RapidActing | CurveKind::UltraRapid => {
                if t >= self.end {
                    return 0.0;
                }
                let (tau, a, s, end) = (self.tau, self.a, self.s, self.end);
                let v = 1.0
                    - s * (1.0 - a)
                        * ((t * t / (tau * end * (1.0 - a)) - t / tau - 1.0) * (-t / tau).exp()
                            + 1.0);
                v.clamp(0.0, 1.0)
            }
        }
    }

    /// Fraction of a dose absorbed per minute, `t` minutes after delivery.
    pub fn activity(&self, t: f64) -> f64 {
        if t.is_nan() || t < 0.0 {
            return 0.0;
        }
        match self.kind {
            CurveKind::Bilinear => self.bilinear(t).1,
            CurveKind::RapidActing | CurveKind::UltraRapid => {
                if t >= self.end {
                    return 0.0;
                }
                let (tau, s, end) = (self.tau, self.s, self.end);
                ((s / (tau * tau)) * t * (1.0 - t / end) * (-t / tau).exp()).max(0.0)
            }
        }
    }

    /// (iob fraction, activity) of the legacy curve.
    fn bilinear(&self, t: f64) -> (f64, f64) {
        let scaled = t * BILINEAR_DIA_HOURS / self.dia_hours;
        let activity_peak = 2.0 / (self.dia_hours * 60.0);
        let slope_up = activity_peak / BILINEAR_PEAK_MIN;
        let slope_down = -activity_peak / (BILINEAR_END_MIN - BILINEAR_PEAK_MIN);
        if scaled < BILINEAR_PEAK_MIN {
            let x1 = scaled / 5.0 + 1.0;
            let iob = -0.001852 * x1 * x1 + 0.001852 * x1 + 1.0;
            (iob.clamp(0.0, 1.0), slope_up * scaled)
        } else if scaled < BILINEAR_END_MIN {
            let past_peak = scaled - BILINEAR_PEAK_MIN;
            let x2 = past_peak / 5.0;
            let iob = 0.001323 * x2 * x2 - 0.054233 * x2 + 0.555560;
            (iob.clamp(0.0, 1.0), (activity_peak + slope_down * past_peak).max(0.0))
        } else {
            (0.0, 0.0)
        }
    }
}
