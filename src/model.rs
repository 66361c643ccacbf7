use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

const MAX_NEWTON_ITERS: usize = 100;
const STEP_TOL: f64 = 1e-10;

/// Per-column standardization fitted on the training rows only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Population std; constant columns get scale 1 so they map to 0.
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let dim = rows.first().map(|r| r.len()).unwrap_or(0);
        let n = rows.len().max(1) as f64;
        let mut mean = vec![0.0; dim];
        for r in rows {
            for (m, x) in mean.iter_mut().zip(r) {
                *m += x / n;
            }
        }
        let mut var = vec![0.0; dim];
        for r in rows {
            for ((v, x), m) in var.iter_mut().zip(r).zip(&mean) {
                *v += (x - m).powi(2) / n;
            }
        }
        let scale = var
            .into_iter()
            .map(|v| {
                let s = v.sqrt();
                if s > 1e-12 { s } else { 1.0 }
            })
            .collect();
        Self { mean, scale }
    }

    pub fn transform(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(&self.mean)
            .zip(&self.scale)
            .map(|((x, m), s)| (x - m) / s)
            .collect()
    }

    pub fn transform_all(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter().map(|r| self.transform(r)).collect()
    }
}

/// Binary L2-regularized logistic regression. The intercept is not penalized.
///
/// `classes` holds the two label values in ascending order; `coefficients`
/// push toward `classes[1]`. Probabilities are always looked up by label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub classes: [u8; 2],
    /// Inverse regularization strength.
    pub c: f64,
}

impl LogisticRegression {
    pub fn fit(x: &[Vec<f64>], labels: &[u8], c: f64) -> Result<Self> {
        if x.is_empty() || x.len() != labels.len() {
            return Err(ForecastError::DegenerateTrainingSet(format!(
                "{} rows vs {} labels",
                x.len(),
                labels.len()
            )));
        }
        let mut classes: Vec<u8> = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();
        let &[lo, hi] = classes.as_slice() else {
            return Err(ForecastError::DegenerateTrainingSet(format!(
                "expected two label classes, found {classes:?}"
            )));
        };

        let y: Vec<f64> = labels
            .iter()
            .map(|l| if *l == hi { 1.0 } else { 0.0 })
            .collect();
        let dim = x[0].len();
        let mut theta = vec![0.0; dim + 1];
        let mut loss = objective(&theta, x, &y, c);

        for _ in 0..MAX_NEWTON_ITERS {
            let (grad, hess) = gradient_hessian(&theta, x, &y, c);
            let Some(step) = solve(hess, grad) else {
                break;
            };

            // Backtracking keeps the objective non-increasing.
            let mut t = 1.0;
            let mut accepted = None;
            while t > 1e-8 {
                let candidate: Vec<f64> =
                    theta.iter().zip(&step).map(|(w, s)| w - t * s).collect();
                let cand_loss = objective(&candidate, x, &y, c);
                if cand_loss <= loss + 1e-15 {
                    accepted = Some((candidate, cand_loss));
                    break;
                }
                t *= 0.5;
            }
            let Some((next, next_loss)) = accepted else {
                break;
            };
            let moved = step.iter().map(|s| (t * s).abs()).fold(0.0, f64::max);
            theta = next;
            loss = next_loss;
            if moved < STEP_TOL {
                break;
            }
        }

        let intercept = theta[dim];
        theta.truncate(dim);
        Ok(Self {
            coefficients: theta,
            intercept,
            classes: [lo, hi],
            c,
        })
    }

    pub fn decision_function(&self, x: &[f64]) -> f64 {
        dot(&self.coefficients, x) + self.intercept
    }

    /// Probabilities in `classes` order.
    pub fn predict_proba(&self, x: &[f64]) -> [f64; 2] {
        let p_hi = sigmoid(self.decision_function(x));
        [1.0 - p_hi, p_hi]
    }

    /// Probability of the given label value, or `None` if the model never saw it.
    pub fn prob_for_label(&self, x: &[f64], label: u8) -> Option<f64> {
        let idx = self.classes.iter().position(|c| *c == label)?;
        Some(self.predict_proba(x)[idx])
    }
}

pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

pub fn logit(p: f64) -> f64 {
    let p = p.clamp(1e-12, 1.0 - 1e-12);
    (p / (1.0 - p)).ln()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn linear(theta: &[f64], row: &[f64]) -> f64 {
    let dim = row.len();
    dot(&theta[..dim], row) + theta[dim]
}

fn objective(theta: &[f64], x: &[Vec<f64>], y: &[f64], c: f64) -> f64 {
    let dim = theta.len() - 1;
    let mut nll = 0.0;
    for (row, yi) in x.iter().zip(y) {
        let z = linear(theta, row);
        // log(1 + e^z) - y z, written to avoid overflow.
        nll += z.max(0.0) + (-z.abs()).exp().ln_1p() - yi * z;
    }
    let penalty: f64 = theta[..dim].iter().map(|w| w * w).sum::<f64>() * 0.5;
    c * nll + penalty
}

fn gradient_hessian(theta: &[f64], x: &[Vec<f64>], y: &[f64], c: f64) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n_params = theta.len();
    let dim = n_params - 1;
    let mut grad = vec![0.0; n_params];
    let mut hess = vec![vec![0.0; n_params]; n_params];

    for (row, yi) in x.iter().zip(y) {
        let p = sigmoid(linear(theta, row));
        let r = p - yi;
        let w = (p * (1.0 - p)).max(1e-12);
        for i in 0..n_params {
            let xi = if i < dim { row[i] } else { 1.0 };
            grad[i] += c * r * xi;
            for j in 0..=i {
                let xj = if j < dim { row[j] } else { 1.0 };
                hess[i][j] += c * w * xi * xj;
            }
        }
    }
    for i in 0..n_params {
        if i < dim {
            grad[i] += theta[i];
            hess[i][i] += 1.0;
        }
        for j in 0..i {
            hess[j][i] = hess[i][j];
        }
    }
    (grad, hess)
}

// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-14 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let f = a[row][col] / a[col][col];
            if f == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut out = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * out[k]).sum();
        out[row] = (b[row] - tail) / a[row][row];
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::{LogisticRegression, StandardScaler, logit, sigmoid};

    fn toy() -> (Vec<Vec<f64>>, Vec<u8>) {
        let x = vec![
            vec![-2.0, 0.1],
            vec![-1.0, -0.3],
            vec![-0.5, 0.2],
            vec![0.2, 0.0],
            vec![0.5, -0.1],
            vec![1.0, 0.4],
            vec![2.0, -0.2],
            vec![-0.2, 0.3],
        ];
        let y = vec![0, 0, 1, 0, 1, 1, 1, 0];
        (x, y)
    }

    #[test]
    fn scaler_centers_and_handles_constant_columns() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let s = StandardScaler::fit(&rows);
        assert_eq!(s.mean, vec![2.0, 5.0]);
        assert_eq!(s.scale, vec![1.0, 1.0]);
        assert_eq!(s.transform(&[3.0, 5.0]), vec![1.0, 0.0]);
    }

    #[test]
    fn fit_reaches_a_stationary_point() {
        let (x, y) = toy();
        let m = LogisticRegression::fit(&x, &y, 1.0).unwrap();
        // Gradient of C * NLL + 0.5 |w|^2 vanishes at the optimum.
        let mut g = vec![0.0; 3];
        for (row, label) in x.iter().zip(&y) {
            let r = sigmoid(m.decision_function(row)) - f64::from(*label);
            g[0] += r * row[0];
            g[1] += r * row[1];
            g[2] += r;
        }
        g[0] += m.coefficients[0];
        g[1] += m.coefficients[1];
        assert!(g.iter().all(|v| v.abs() < 1e-6), "gradient {g:?}");
        assert!(m.coefficients[0] > 0.0);
    }

    #[test]
    fn probability_is_selected_by_label_value() {
        let (x, y) = toy();
        let m = LogisticRegression::fit(&x, &y, 1.0).unwrap();
        let p1 = m.prob_for_label(&[1.5, 0.0], 1).unwrap();
        let p0 = m.prob_for_label(&[1.5, 0.0], 0).unwrap();
        assert!(p1 > 0.5);
        assert!((p0 + p1 - 1.0).abs() < 1e-12);
        assert_eq!(m.prob_for_label(&[1.5, 0.0], 7), None);

        // Relabelled classes {3, 5}: positive class is still the larger label.
        let y2: Vec<u8> = y.iter().map(|l| if *l == 1 { 5 } else { 3 }).collect();
        let m2 = LogisticRegression::fit(&x, &y2, 1.0).unwrap();
        assert_eq!(m2.classes, [3, 5]);
        assert!((m2.prob_for_label(&[1.5, 0.0], 5).unwrap() - p1).abs() < 1e-9);
    }

    #[test]
    fn single_class_is_rejected() {
        let x = vec![vec![0.0], vec![1.0]];
        assert!(LogisticRegression::fit(&x, &[1, 1], 1.0).is_err());
        assert!((sigmoid(logit(0.3)) - 0.3).abs() < 1e-12);
    }
}
