//! Numerical constants and floating-point helpers shared by the EM engine.

/// Safe comparison for floating point values (handles NaN)
pub fn float_total_cmp(a: &f64, b: &f64) -> std::cmp::Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        (false, false) => a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal),
    }
}

/// Mathematical constants
pub mod constants {
    /// ½·ln(2π), the per-dimension normalization of a Gaussian density
    pub const HALF_LN_TWO_PI: f64 = 0.9189385332046727417803297364056;

    /// ln of the smallest positive normal f64
    pub const LN_F64_MIN_POSITIVE: f64 = -708.3964185322641;

    /// ln of the largest finite f64
    pub const LN_F64_MAX: f64 = 709.782712893384;

    /// Responsibility mass below which a component is considered empty
    pub const MASS_FLOOR: f64 = f64::MIN_POSITIVE;
}

/// Safe floating-point operations
pub mod float_ops {
    /// Approximate equality, absolute for small magnitudes and relative otherwise
    #[inline]
    pub fn approx_eq_eps(a: f64, b: f64, epsilon: f64) -> bool {
        let scale = a.abs().max(b.abs()).max(1.0);
        (a - b).abs() <= epsilon * scale
    }

    /// Safe division returning None for a zero or non-finite quotient
    #[inline]
    pub fn safe_div(numerator: f64, denominator: f64) -> Option<f64> {
        if denominator == 0.0 {
            return None;
        }
        let q = numerator / denominator;
        if q.is_finite() {
            Some(q)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_constants_match_std() {
        let two_pi = 2.0 * std::f64::consts::PI;
        assert_approx_eq!(constants::HALF_LN_TWO_PI, 0.5 * two_pi.ln(), 1e-15);
        assert_approx_eq!(constants::LN_F64_MIN_POSITIVE, f64::MIN_POSITIVE.ln(), 1e-9);
        assert_approx_eq!(constants::LN_F64_MAX, f64::MAX.ln(), 1e-9);
    }

    #[test]
    fn test_float_ops() {
        assert!(float_ops::approx_eq_eps(1.0, 1.0 + 1e-14, 1e-12));
        assert!(!float_ops::approx_eq_eps(1.0, 1.001, 1e-6));
        assert!(float_ops::approx_eq_eps(1e6, 1e6 + 0.5, 1e-6));
        assert_eq!(float_ops::safe_div(1.0, 0.0), None);
        assert_eq!(float_ops::safe_div(1.0, 4.0), Some(0.25));
    }
}
