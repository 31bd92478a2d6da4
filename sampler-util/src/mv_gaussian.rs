//! Multivariate Gaussian draws and the SPD helpers the classifier
//! posterior needs (inversion, quadratic forms, validity checks).

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

/// `N(mean, Σ)` parameterized by a Cholesky factor.
///
/// Built either from the covariance `Σ = L Lᵀ` (draw `μ + L z`) or from
/// the precision `Σ⁻¹ = L Lᵀ` (draw `μ + L⁻ᵀ z`), so callers holding
/// only a precision never have to invert it.
#[derive(Debug, Clone)]
pub struct MvGaussian {
    mean: DVector<f64>,
    chol_l: DMatrix<f64>,
    from_precision: bool,
}

impl MvGaussian {
    /// Gaussian with the given mean and covariance.
    pub fn from_covariance(mean: DVector<f64>, cov: &DMatrix<f64>) -> anyhow::Result<Self> {
        check_square(&mean, cov)?;
        let chol = cov
            .clone()
            .cholesky()
            .ok_or_else(|| anyhow::anyhow!("covariance is not positive definite"))?;
        Ok(MvGaussian {
            mean,
            chol_l: chol.l(),
            from_precision: false,
        })
    }

    /// Gaussian with the given mean and precision (inverse covariance).
    pub fn from_precision(mean: DVector<f64>, precision: &DMatrix<f64>) -> anyhow::Result<Self> {
        check_square(&mean, precision)?;
        let chol = precision
            .clone()
            .cholesky()
            .ok_or_else(|| anyhow::anyhow!("precision is not positive definite"))?;
        Ok(MvGaussian {
            mean,
            chol_l: chol.l(),
            from_precision: true,
        })
    }

    /// Dimension of the distribution.
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Mean vector.
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// Draw one vector.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> anyhow::Result<DVector<f64>> {
        let z = standard_normal_vector(self.dim(), rng);
        let offset = if self.from_precision {
            self.chol_l
                .transpose()
                .solve_upper_triangular(&z)
                .ok_or_else(|| anyhow::anyhow!("singular precision factor"))?
        } else {
            &self.chol_l * z
        };
        Ok(&self.mean + offset)
    }
}

fn check_square(mean: &DVector<f64>, m: &DMatrix<f64>) -> anyhow::Result<()> {
    if m.nrows() != m.ncols() || m.nrows() != mean.len() {
        anyhow::bail!(
            "dimension mismatch: mean {} vs matrix {}x{}",
            mean.len(),
            m.nrows(),
            m.ncols()
        );
    }
    Ok(())
}

/// A vector of `N(0,1)` draws.
pub fn standard_normal_vector<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> DVector<f64> {
    DVector::from_fn(dim, |_, _| rng.sample::<f64, _>(StandardNormal))
}

/// Inverse of a symmetric positive definite matrix via Cholesky.
///
/// The result is symmetrized so round-off never breaks symmetry.
pub fn spd_inverse(m: &DMatrix<f64>) -> anyhow::Result<DMatrix<f64>> {
    let chol = m
        .clone()
        .cholesky()
        .ok_or_else(|| anyhow::anyhow!("matrix is not positive definite"))?;
    let mut inv = chol.inverse();
    symmetrize(&mut inv);
    Ok(inv)
}

/// `m <- (m + mᵀ) / 2`
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

/// `xᵀ A x`
pub fn quad_form(x: &DVector<f64>, a: &DMatrix<f64>) -> f64 {
    x.dot(&(a * x))
}

/// Symmetric within `tol` and positive semi-definite.
///
/// PSD is checked by a Cholesky factorization of `m + tol·I`.
pub fn is_symmetric_psd(m: &DMatrix<f64>, tol: f64) -> bool {
    if m.nrows() != m.ncols() || m.iter().any(|x| !x.is_finite()) {
        return false;
    }
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            if (m[(i, j)] - m[(j, i)]).abs() > tol {
                return false;
            }
        }
    }
    let shifted = m + DMatrix::<f64>::identity(n, n) * tol;
    shifted.cholesky().is_some()
}
