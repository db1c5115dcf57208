//! Sparse block normal equations and the Schur-complement solve.
//!
//! The Hessian approximation `Jᵗ·W·J` is kept as three block containers:
//!
//! - `HAp`: pose×pose blocks, upper triangle only (all Cholesky needs),
//! - `Hf`: landmark diagonal blocks — a landmark's Hessian couples only to
//!   the poses observing it, never to another landmark, so the landmark
//!   part is block diagonal by construction,
//! - `HApf`: pose×landmark cross blocks, the basis of the Schur split.
//!
//! Solving eliminates the landmark blocks first (tiny per-landmark
//! factorizations), forms the reduced dense pose system, solves it by
//! Cholesky, and back-substitutes the landmark steps.

use std::collections::BTreeMap;

use nalgebra::{linalg::Cholesky, DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::jacobians::ObsLinearization;

/// Floor applied to Hessian diagonal entries before damping, so unknowns
/// with no constraint still produce a positive-definite damped system.
const DIAG_FLOOR: f64 = 1.0;

/// Sparsity statistics of the active problem matrices.
///
/// Collected only when enabled in parameters; `*_max_size` is the number of
/// blocks a dense layout would hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SparsityStats {
    /// Nonzero `dh/dAp` Jacobian blocks.
    pub dh_dap_nnz: usize,
    /// Dense block count of the `dh/dAp` Jacobian.
    pub dh_dap_max_size: usize,
    /// Nonzero `dh/df` Jacobian blocks.
    pub dh_df_nnz: usize,
    /// Dense block count of the `dh/df` Jacobian.
    pub dh_df_max_size: usize,
    /// Nonzero pose×pose Hessian blocks (upper triangle).
    pub hap_nnz: usize,
    /// Dense upper-triangle block count of the pose×pose Hessian.
    pub hap_max_size: usize,
    /// Nonzero landmark diagonal blocks.
    pub hf_nnz: usize,
    /// Landmark diagonal block count.
    pub hf_max_size: usize,
    /// Nonzero pose×landmark cross blocks.
    pub hapf_nnz: usize,
    /// Dense block count of the cross term.
    pub hapf_max_size: usize,
}

/// Solution of one damped normal-equation system.
pub(crate) struct StepSolution {
    /// Per-pose-unknown increments, `dof` scalars each.
    pub pose_steps: Vec<DVector<f64>>,
    /// Per-landmark-unknown increments, `lm_dims` scalars each.
    pub lm_steps: Vec<DVector<f64>>,
}

/// Block normal equations `(Jᵗ·W·J) δ = Jᵗ·W·r` for one linearization.
pub(crate) struct NormalEquations {
    dof: usize,
    lm_dims: usize,
    num_pose: usize,
    num_lm: usize,
    /// Upper triangle `(i, j)` with `i <= j`.
    hap: BTreeMap<(usize, usize), DMatrix<f64>>,
    /// Landmark diagonal blocks, one per landmark unknown.
    hf: Vec<DMatrix<f64>>,
    /// Cross blocks `(pose col, landmark col)`.
    hapf: BTreeMap<(usize, usize), DMatrix<f64>>,
    grad_pose: Vec<DVector<f64>>,
    grad_lm: Vec<DVector<f64>>,
}

impl NormalEquations {
    pub fn new(num_pose: usize, num_lm: usize, dof: usize, lm_dims: usize) -> Self {
        Self {
            dof,
            lm_dims,
            num_pose,
            num_lm,
            hap: BTreeMap::new(),
            hf: (0..num_lm).map(|_| DMatrix::zeros(lm_dims, lm_dims)).collect(),
            hapf: BTreeMap::new(),
            grad_pose: (0..num_pose).map(|_| DVector::zeros(dof)).collect(),
            grad_lm: (0..num_lm).map(|_| DVector::zeros(lm_dims)).collect(),
        }
    }

    /// Accumulate one observation's `Jᵗ·W·J` and `Jᵗ·W·r` contributions.
    ///
    /// `lm_col` is the landmark-unknown column of the observation's `dh/df`
    /// block, when there is one.
    pub fn accumulate(
        &mut self,
        lin: &ObsLinearization,
        lm_col: Option<usize>,
        residual: &DVector<f64>,
        weight: f64,
    ) {
        for (ci, ji) in &lin.j_pose {
            let jit = ji.transpose();
            self.grad_pose[*ci] += &jit * residual * weight;
            for (cj, jj) in &lin.j_pose {
                if ci > cj {
                    continue;
                }
                let contribution = &jit * jj * weight;
                match self.hap.get_mut(&(*ci, *cj)) {
                    Some(block) => *block += contribution,
                    None => {
                        self.hap.insert((*ci, *cj), contribution);
                    }
                }
            }
            if let (Some(jf), Some(lc)) = (&lin.j_lm, lm_col) {
                let contribution = &jit * jf * weight;
                match self.hapf.get_mut(&(*ci, lc)) {
                    Some(block) => *block += contribution,
                    None => {
                        self.hapf.insert((*ci, lc), contribution);
                    }
                }
            }
        }
        if let (Some(jf), Some(lc)) = (&lin.j_lm, lm_col) {
            let jft = jf.transpose();
            self.hf[lc] += &jft * jf * weight;
            self.grad_lm[lc] += &jft * residual * weight;
        }
    }

    /// Diagonal scale of the (undamped) Hessian: mean of scalar diagonal
    /// entries, used to seed λ.
    pub fn diagonal_scale(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for col in 0..self.num_pose {
            if let Some(block) = self.hap.get(&(col, col)) {
                for d in 0..self.dof {
                    sum += block[(d, d)];
                    count += 1;
                }
            }
        }
        for block in &self.hf {
            for d in 0..self.lm_dims {
                sum += block[(d, d)];
                count += 1;
            }
        }
        if count == 0 {
            1.0
        } else {
            sum / count as f64
        }
    }

    /// `δᵗ(λ·D∘δ + g)`: the linear model's predicted error decrease, used
    /// in the gain ratio.
    pub fn predicted_decrease(&self, solution: &StepSolution, lambda: f64) -> f64 {
        let mut total = 0.0;
        for (col, step) in solution.pose_steps.iter().enumerate() {
            let diag = self.hap.get(&(col, col));
            for d in 0..self.dof {
                let h_dd = diag.map_or(0.0, |block| block[(d, d)]);
                total += step[d] * (lambda * h_dd.max(DIAG_FLOOR) * step[d] + self.grad_pose[col][d]);
            }
        }
        for (col, step) in solution.lm_steps.iter().enumerate() {
            for d in 0..self.lm_dims {
                let h_dd = self.hf[col][(d, d)];
                total += step[d] * (lambda * h_dd.max(DIAG_FLOOR) * step[d] + self.grad_lm[col][d]);
            }
        }
        total
    }

    /// Damped per-landmark block inverses, or `None` on an indefinite block.
    fn landmark_inverses(&self, lambda: f64) -> Option<Vec<DMatrix<f64>>> {
        let mut inverses = Vec::with_capacity(self.num_lm);
        for block in &self.hf {
            let mut damped = block.clone();
            for d in 0..self.lm_dims {
                damped[(d, d)] += lambda * damped[(d, d)].max(DIAG_FLOOR);
            }
            let chol = Cholesky::new(damped)?;
            inverses.push(chol.inverse());
        }
        Some(inverses)
    }

    /// Assemble the Schur-reduced dense pose system at damping `lambda`
    /// (`lambda == 0.0` gives the undamped system, no diagonal floor).
    fn reduced_system(&self, lambda: f64, hf_inv: &[DMatrix<f64>]) -> (DMatrix<f64>, DVector<f64>) {
        let n = self.num_pose * self.dof;
        let mut hred: DMatrix<f64> = DMatrix::zeros(n, n);
        let mut gred = DVector::zeros(n);

        for ((i, j), block) in &self.hap {
            for r in 0..self.dof {
                for c in 0..self.dof {
                    hred[(i * self.dof + r, j * self.dof + c)] += block[(r, c)];
                    if i != j {
                        hred[(j * self.dof + c, i * self.dof + r)] += block[(r, c)];
                    }
                }
            }
        }
        if lambda > 0.0 {
            for k in 0..n {
                hred[(k, k)] += lambda * hred[(k, k)].max(DIAG_FLOOR);
            }
        }
        for (col, grad) in self.grad_pose.iter().enumerate() {
            for d in 0..self.dof {
                gred[col * self.dof + d] = grad[d];
            }
        }

        // Schur complement: subtract HApf·Hf⁻¹·HApfᵗ and HApf·Hf⁻¹·g_f.
        let mut by_lm: Vec<Vec<(usize, &DMatrix<f64>)>> = vec![Vec::new(); self.num_lm];
        for ((i, l), block) in &self.hapf {
            by_lm[*l].push((*i, block));
        }
        for (l, entries) in by_lm.iter().enumerate() {
            let a_inv = &hf_inv[l];
            for &(i, bil) in entries {
                let bil_ainv = bil * a_inv;
                let gi = &bil_ainv * &self.grad_lm[l];
                for d in 0..self.dof {
                    gred[i * self.dof + d] -= gi[d];
                }
                for &(j, bjl) in entries {
                    let contribution = &bil_ainv * bjl.transpose();
                    for r in 0..self.dof {
                        for c in 0..self.dof {
                            hred[(i * self.dof + r, j * self.dof + c)] -= contribution[(r, c)];
                        }
                    }
                }
            }
        }

        (hred, gred)
    }

    /// Solve the damped system via the Schur complement.
    ///
    /// Returns `None` when a factorization fails (singular/indefinite
    /// system at this λ).
    pub fn solve_damped(&self, lambda: f64) -> Option<StepSolution> {
        let hf_inv = self.landmark_inverses(lambda)?;

        if self.num_pose == 0 {
            // Landmark-only problem: the system is already block diagonal.
            let lm_steps = (0..self.num_lm)
                .map(|l| &hf_inv[l] * &self.grad_lm[l])
                .collect();
            return Some(StepSolution {
                pose_steps: Vec::new(),
                lm_steps,
            });
        }

        let (hred, gred) = self.reduced_system(lambda, &hf_inv);
        let chol = Cholesky::new(hred)?;
        let dp = chol.solve(&gred);

        let pose_steps: Vec<DVector<f64>> = (0..self.num_pose)
            .map(|col| {
                DVector::from_iterator(self.dof, (0..self.dof).map(|d| dp[col * self.dof + d]))
            })
            .collect();

        // Back-substitution: δf = Hf⁻¹ (g_f − HApfᵗ δp).
        let mut lm_steps: Vec<DVector<f64>> = Vec::with_capacity(self.num_lm);
        for l in 0..self.num_lm {
            let mut rhs = self.grad_lm[l].clone();
            for ((i, lc), block) in &self.hapf {
                if *lc == l {
                    rhs -= block.transpose() * &pose_steps[*i];
                }
            }
            lm_steps.push(&hf_inv[l] * rhs);
        }

        Some(StepSolution {
            pose_steps,
            lm_steps,
        })
    }

    /// Condition number of the undamped reduced pose system.
    ///
    /// Costs an SVD of the reduced matrix; computed only when requested.
    pub fn condition_number(&self) -> Option<f64> {
        if self.num_pose == 0 {
            return None;
        }
        let hf_inv = self.landmark_inverses(0.0)?;
        let (hred, _) = self.reduced_system(0.0, &hf_inv);
        let singular = hred.singular_values();
        let max = singular.iter().cloned().fold(f64::MIN, f64::max);
        let min = singular.iter().cloned().fold(f64::MAX, f64::min);
        if min <= 0.0 {
            None
        } else {
            Some(max / min)
        }
    }

    /// Sparsity statistics over this system and its Jacobian rows.
    pub fn sparsity_stats(&self, lins: &[ObsLinearization]) -> SparsityStats {
        let dh_dap_nnz = lins.iter().map(|lin| lin.j_pose.len()).sum();
        let dh_df_nnz = lins.iter().filter(|lin| lin.j_lm.is_some()).count();
        SparsityStats {
            dh_dap_nnz,
            dh_dap_max_size: lins.len() * self.num_pose,
            dh_df_nnz,
            dh_df_max_size: lins.len() * self.num_lm,
            hap_nnz: self.hap.len(),
            hap_max_size: self.num_pose * (self.num_pose + 1) / 2,
            hf_nnz: self
                .hf
                .iter()
                .filter(|block| block.iter().any(|v| *v != 0.0))
                .count(),
            hf_max_size: self.num_lm,
            hapf_nnz: self.hapf.len(),
            hapf_max_size: self.num_pose * self.num_lm,
        }
    }
}
