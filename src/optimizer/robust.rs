//! Robust estimation policy: information weighting, Huber widths, and χ²
//! gates for every factor kind.
//!
//! One table drives both graph construction (robust width = √bound) and
//! outlier classification (χ² > bound), so the two can never disagree.

use nalgebra::DMatrix;

use crate::atlas::PlaneRelation;
use crate::config::PlaneSettings;

/// χ² 95% quantile for 2 degrees of freedom.
pub const CHI2_MONO: f64 = 5.991;
/// χ² 95% quantile for 3 degrees of freedom.
pub const CHI2_STEREO: f64 = 7.815;

/// Factor kinds that are gated by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactorKind {
    Mono,
    Stereo,
    Plane,
    NotSeenPlane,
    ParallelPlane,
    VerticalPlane,
}

impl From<PlaneRelation> for FactorKind {
    fn from(relation: PlaneRelation) -> Self {
        match relation {
            PlaneRelation::Seen => FactorKind::Plane,
            PlaneRelation::NotSeen => FactorKind::NotSeenPlane,
            PlaneRelation::Parallel => FactorKind::ParallelPlane,
            PlaneRelation::Vertical => FactorKind::VerticalPlane,
        }
    }
}

/// Huber cost and IRLS weight for a squared whitened residual.
///
/// Below `delta²` the cost is quadratic; above, it grows linearly with the
/// residual norm and the weight becomes `delta / |e|`.
pub fn huber(chi2: f64, delta: Option<f64>) -> (f64, f64) {
    let Some(delta) = delta else {
        return (chi2, 1.0);
    };
    let delta2 = delta * delta;
    if chi2 <= delta2 {
        (chi2, 1.0)
    } else {
        let e = chi2.sqrt();
        (2.0 * delta * e - delta2, delta / e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustPolicy {
    pub plane: PlaneSettings,
}

impl RobustPolicy {
    pub fn new(plane: PlaneSettings) -> Self {
        Self { plane }
    }

    /// Outlier gate on `e^T Ω e`.
    pub fn chi2_bound(&self, kind: FactorKind) -> f64 {
        match kind {
            FactorKind::Mono => CHI2_MONO,
            FactorKind::Stereo => CHI2_STEREO,
            FactorKind::Plane => self.plane.chi,
            FactorKind::NotSeenPlane => self.plane.chi / 2.0,
            FactorKind::ParallelPlane | FactorKind::VerticalPlane => self.plane.vp_chi,
        }
    }

    /// Huber width, always the square root of the χ² gate.
    pub fn huber_delta(&self, kind: FactorKind) -> f64 {
        self.chi2_bound(kind).sqrt()
    }

    pub fn is_outlier(&self, kind: FactorKind, chi2: f64) -> bool {
        chi2 > self.chi2_bound(kind)
    }

    /// Isotropic pixel information scaled by the keypoint's level variance.
    pub fn reprojection_information(&self, kind: FactorKind, inv_sigma2: f64) -> DMatrix<f64> {
        let dim = if kind == FactorKind::Stereo { 3 } else { 2 };
        DMatrix::identity(dim, dim) * inv_sigma2
    }

    /// Information of a plane relation, scaled by `scale` (seen-flag weighting).
    pub fn plane_information(&self, relation: PlaneRelation, scale: f64) -> DMatrix<f64> {
        match relation {
            PlaneRelation::Seen | PlaneRelation::NotSeen => {
                let base = if relation == PlaneRelation::NotSeen {
                    0.5
                } else {
                    1.0
                };
                let angle = self.plane.angle_information();
                let dist = self.plane.distance_information();
                DMatrix::from_diagonal(&nalgebra::DVector::from_column_slice(&[
                    angle, angle, dist,
                ])) * (base * scale)
            }
            PlaneRelation::Parallel => {
                DMatrix::identity(2, 2) * (self.plane.parallel_information() * scale)
            }
            PlaneRelation::Vertical => {
                DMatrix::identity(2, 2) * (self.plane.vertical_information() * scale)
            }
        }
    }
}

impl Default for RobustPolicy {
    fn default() -> Self {
        Self::new(PlaneSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_huber_matches_quadratic_inside_and_linear_outside() {
        assert_eq!(huber(4.0, None), (4.0, 1.0));
        assert_eq!(huber(4.0, Some(3.0)), (4.0, 1.0));
        let (cost, weight) = huber(16.0, Some(2.0));
        assert_relative_eq!(cost, 2.0 * 2.0 * 4.0 - 4.0);
        assert_relative_eq!(weight, 0.5);
    }

    #[test]
    fn test_bounds_and_widths() {
        let policy = RobustPolicy::default();
        assert_relative_eq!(policy.huber_delta(FactorKind::Mono), 5.991f64.sqrt());
        assert_relative_eq!(policy.chi2_bound(FactorKind::NotSeenPlane), 50.0);
        assert_relative_eq!(policy.huber_delta(FactorKind::NotSeenPlane), 50.0f64.sqrt());
        assert_relative_eq!(policy.chi2_bound(FactorKind::VerticalPlane), 50.0);
        assert!(policy.is_outlier(FactorKind::Stereo, 7.9));
        assert!(!policy.is_outlier(FactorKind::Stereo, 7.8));
    }

    #[test]
    fn test_plane_information_weighting() {
        let policy = RobustPolicy::default();
        let seen = policy.plane_information(PlaneRelation::Seen, 2.0);
        assert_relative_eq!(seen[(0, 0)], 2.0 * 3282.8 / 0.25, epsilon = 1e-9);
        assert_relative_eq!(seen[(2, 2)], 2.0 * 2500.0, epsilon = 1e-9);

        let not_seen = policy.plane_information(PlaneRelation::NotSeen, 1.0);
        assert_relative_eq!(not_seen[(2, 2)], 1250.0, epsilon = 1e-9);

        let parallel = policy.plane_information(PlaneRelation::Parallel, 1.0);
        assert_eq!(parallel.shape(), (2, 2));
    }
}
