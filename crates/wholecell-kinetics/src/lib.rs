//! Stateless numeric primitives shared by the whole-cell process catalog.
//!
//! Every function here is total: negative, zero, or non-finite inputs
//! degrade to a zero rate (or an empty sample) instead of panicking, and
//! all stochastic sampling is a pure function of the RNG handle passed in.

use rand::Rng;
use rand_distr::StandardNormal;

/// Universal gas constant in J/(mol*K).
pub const GAS_CONSTANT: f64 = 8.314;

/// Exact-simulation cutoff for [`poisson`]; above this a normal
/// approximation is used.
const POISSON_EXACT_MAX: f64 = 30.0;

/// Draw a Poisson-distributed event count with mean `lambda`.
///
/// `lambda <= 0` (or non-finite) returns 0. Small means use Knuth's
/// multiplication method; large means fall back to a rounded normal
/// approximation `N(lambda, sqrt(lambda))` floored at zero.
pub fn poisson<R: Rng + ?Sized>(rng: &mut R, lambda: f64) -> u64 {
    if !lambda.is_finite() || lambda <= 0.0 {
        return 0;
    }
    if lambda <= POISSON_EXACT_MAX {
        let threshold = (-lambda).exp();
        let mut count = 0u64;
        let mut product: f64 = rng.random();
        while product > threshold {
            count += 1;
            product *= rng.random::<f64>();
        }
        count
    } else {
        let z: f64 = rng.sample(StandardNormal);
        let sample = lambda + lambda.sqrt() * z;
        sample.round().max(0.0) as u64
    }
}

/// Michaelis-Menten saturation rate `vmax * s / (km + s)`.
///
/// Returns 0 for non-positive substrate or `vmax`; monotone increasing in
/// `s` and asymptotic to `vmax`.
#[must_use]
pub fn michaelis_menten(s: f64, vmax: f64, km: f64) -> f64 {
    if !s.is_finite() || !vmax.is_finite() || s <= 0.0 || vmax <= 0.0 {
        return 0.0;
    }
    let km = if km.is_finite() { km.max(0.0) } else { return 0.0 };
    let rate = vmax * s / (km + s);
    if rate.is_finite() { rate } else { 0.0 }
}

/// Hill cooperative-binding response `x^n / (k^n + x^n)`, always in [0, 1].
///
/// Returns 0 for non-positive `x` or `k`. Computed as `1 / (1 + (k/x)^n)`
/// so extreme `x` saturates toward 1 instead of overflowing.
#[must_use]
pub fn hill(x: f64, k: f64, n: f64) -> f64 {
    if !x.is_finite() || !k.is_finite() || x <= 0.0 || k <= 0.0 {
        return 0.0;
    }
    let ratio = (k / x).powf(n);
    let value = 1.0 / (1.0 + ratio);
    if value.is_finite() { value } else { 0.0 }
}

/// Competitive-inhibition scaling `ki / (ki + conc)` in (0, 1].
///
/// Missing or non-positive `ki` data means "no inhibition" and returns 1.
#[must_use]
pub fn competitive_inhibition(conc: f64, ki: f64) -> f64 {
    if !ki.is_finite() || ki <= 0.0 || !conc.is_finite() || conc <= 0.0 {
        return 1.0;
    }
    ki / (ki + conc)
}

/// Thermodynamic feasibility factor `clamp(exp(-dG / RT), 0, 1)`.
///
/// Only thermodynamically unfavorable reactions (`delta_g > 0`) are
/// penalized; favorable ones pass through at 1.
#[must_use]
pub fn thermodynamic_factor(delta_g: f64, temperature_k: f64) -> f64 {
    if !delta_g.is_finite() || delta_g <= 0.0 {
        return 1.0;
    }
    let rt = GAS_CONSTANT * temperature_k.max(1.0);
    (-delta_g / rt).exp().clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    #[test]
    fn poisson_degenerate_inputs_yield_zero() {
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(poisson(&mut rng, 0.0), 0);
        assert_eq!(poisson(&mut rng, -3.0), 0);
        assert_eq!(poisson(&mut rng, f64::NAN), 0);
        assert_eq!(poisson(&mut rng, f64::INFINITY), 0);
    }

    #[test]
    fn poisson_mean_tracks_lambda() {
        let mut rng = SmallRng::seed_from_u64(0xCE11);
        for &lambda in &[1.0, 10.0, 25.0, 50.0] {
            let draws = 10_000;
            let total: u64 = (0..draws).map(|_| poisson(&mut rng, lambda)).sum();
            let mean = total as f64 / draws as f64;
            assert!(
                (mean - lambda).abs() < lambda * 0.05,
                "lambda={lambda} mean={mean}"
            );
        }
    }

    #[test]
    fn poisson_is_deterministic_per_seed() {
        let draw = |seed: u64| {
            let mut rng = SmallRng::seed_from_u64(seed);
            (0..64).map(|_| poisson(&mut rng, 7.5)).collect::<Vec<_>>()
        };
        assert_eq!(draw(99), draw(99));
        assert_ne!(draw(99), draw(100));
    }

    #[test]
    fn michaelis_menten_boundary_behaviour() {
        assert_eq!(michaelis_menten(0.0, 5.0, 0.5), 0.0);
        assert_eq!(michaelis_menten(-1.0, 5.0, 0.5), 0.0);
        assert_eq!(michaelis_menten(1.0, 0.0, 0.5), 0.0);
        assert_eq!(michaelis_menten(f64::NAN, 5.0, 0.5), 0.0);

        // Strictly increasing in substrate, asymptotic to vmax.
        let mut previous = 0.0;
        for step in 1..200 {
            let rate = michaelis_menten(step as f64 * 0.1, 5.0, 0.5);
            assert!(rate > previous);
            assert!(rate < 5.0);
            previous = rate;
        }
        assert!(michaelis_menten(1e9, 5.0, 0.5) > 4.999);
    }

    #[test]
    fn hill_stays_in_unit_interval() {
        assert_eq!(hill(0.0, 2.0, 2.0), 0.0);
        assert_eq!(hill(5.0, 0.0, 2.0), 0.0);
        for step in 1..100 {
            let value = hill(step as f64 * 0.25, 2.0, 2.0);
            assert!((0.0..1.0).contains(&value), "value={value}");
        }
        assert!((hill(2.0, 2.0, 2.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn hill_saturates_at_extreme_inputs() {
        // x^n would overflow here; the response must approach 1, not drop
        // back to 0.
        let saturated = hill(1e300, 2.0, 2.0);
        assert!(saturated > 0.999_999 && saturated <= 1.0);

        // (k/x)^n overflows instead at tiny x; the response stays at 0.
        let vanishing = hill(1e-300, 2.0, 2.0);
        assert!((0.0..1e-12).contains(&vanishing));
    }

    #[test]
    fn inhibition_and_thermodynamics_are_bounded() {
        assert_eq!(competitive_inhibition(0.0, 1.0), 1.0);
        assert_eq!(competitive_inhibition(1.0, 0.0), 1.0);
        assert!((competitive_inhibition(1.0, 1.0) - 0.5).abs() < 1e-12);

        assert_eq!(thermodynamic_factor(-20_000.0, 310.0), 1.0);
        let penalty = thermodynamic_factor(20_000.0, 310.0);
        assert!(penalty > 0.0 && penalty < 1.0);
    }
}
