// sparse.rs — Sparse Gaussian elimination for equilibrium distributions
//
// Square sparse matrix over doubles, augmented with one extra column for
// the normalization equation. Rows are kept sorted by column; elimination
// walks two rows in lock step, deleting entries that cancel to exactly
// zero. Pivot search defers the dense normalization row (the last row) as
// long as another row can supply the pivot.
//
// Preconditions: entries are set through `set` with columns `0..=n`.
// Postconditions: `solve` consumes the matrix.
// Failure modes: `SingularSystem` when a pivot is zero after deferral.
// Side effects: none.

use crate::error::AnalysisError;

/// Sparse `n × (n+1)` matrix; column `n` is the right-hand side.
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    n: usize,
    rows: Vec<Vec<(u32, f64)>>,
}

impl SparseMatrix {
    pub fn new(n: usize) -> Self {
        SparseMatrix {
            n,
            rows: vec![Vec::new(); n],
        }
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        let r = &mut self.rows[row];
        match r.binary_search_by_key(&(col as u32), |&(c, _)| c) {
            Ok(i) => r[i].1 = value,
            Err(i) => r.insert(i, (col as u32, value)),
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.rows[row]
            .binary_search_by_key(&(col as u32), |&(c, _)| c)
            .map(|i| self.rows[row][i].1)
            .unwrap_or(0.0)
    }

    /// Solve the augmented system by Gaussian elimination with partial
    /// pivoting that postpones using the last row as long as possible.
    pub fn solve(mut self) -> Result<Vec<f64>, AnalysisError> {
        let n = self.n;
        if n == 1 {
            return Ok(vec![1.0]);
        }

        for i in 0..n - 1 {
            // Pivot: the largest leading entry in column i among the rows
            // below, falling back to the last row only when no other row
            // leads with column i.
            let mut maximum = self.rows[i].first().map_or(0.0, |&(_, v)| v);
            let mut index = i;
            let mut found = false;
            for (j, row) in self.rows.iter().enumerate().take(n - 1).skip(i + 1) {
                if let Some(&(col, v)) = row.first() {
                    if col as usize == i {
                        found = true;
                        if v.abs() > maximum.abs() {
                            maximum = v;
                            index = j;
                        }
                    }
                }
            }
            if !found {
                maximum = self.rows[n - 1].first().map_or(0.0, |&(_, v)| v);
                index = n - 1;
            }
            if maximum == 0.0 {
                return Err(AnalysisError::SingularSystem(i));
            }
            if index != i {
                self.rows.swap(i, index);
            }

            // Subtract the scaled pivot row from every row leading with
            // column i, dropping its leading entry.
            let pivot_row = std::mem::take(&mut self.rows[i]);
            for j in i + 1..n {
                let lead = match self.rows[j].first() {
                    Some(&(col, v)) if col as usize == i => v,
                    _ => continue,
                };
                let factor = -lead / maximum;
                let merged = merge_scaled(&self.rows[j][1..], &pivot_row[1..], factor);
                self.rows[j] = merged;
            }
            self.rows[i] = pivot_row;
        }

        // Back substitution; column n carries the right-hand side.
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let row = &self.rows[i];
            let pivot = match row.first() {
                Some(&(_, v)) if v != 0.0 => v,
                _ => return Err(AnalysisError::SingularSystem(i)),
            };
            let mut sum = 0.0;
            if i < n - 1 {
                for &(col, v) in &row[1..] {
                    if (col as usize) < n {
                        sum += v * x[col as usize];
                    }
                }
            }
            let rhs = row
                .iter()
                .rev()
                .find(|&&(c, _)| c as usize == self.n)
                .map_or(0.0, |&(_, v)| v);
            x[i] = (rhs - sum) / pivot;
        }
        Ok(x)
    }
}

/// `a + factor * b` over sorted sparse rows; entries that cancel to exactly
/// zero are dropped.
fn merge_scaled(a: &[(u32, f64)], b: &[(u32, f64)], factor: f64) -> Vec<(u32, f64)> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push((b[j].0, factor * b[j].1));
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                let v = a[i].1 + factor * b[j].1;
                if v != 0.0 {
                    out.push((a[i].0, v));
                }
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend(b[j..].iter().map(|&(c, v)| (c, factor * v)));
    out
}

/// Build the augmented equilibrium system for a transition matrix given as
/// `(dst, src, probability)` triples: `M[dst][src] = P(src → dst)` with the
/// diagonal shifted by −1, and the last row replaced by the normalization
/// equation.
pub fn equilibrium_system(n: usize, transitions: &[(usize, usize, f64)]) -> SparseMatrix {
    let mut m = SparseMatrix::new(n);
    for &(dst, src, p) in transitions {
        if dst < n - 1 {
            m.set(dst, src, p);
        }
    }
    for i in 0..=n {
        m.set(n - 1, i, 1.0);
        if i + 1 < n {
            let d = m.get(i, i);
            m.set(i, i, d - 1.0);
        }
    }
    m
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn residual(n: usize, transitions: &[(usize, usize, f64)], pi: &[f64]) -> f64 {
        // max over dst of |sum_src P(src->dst) pi[src] - pi[dst]|
        let mut worst = 0f64;
        for dst in 0..n {
            let mut acc = 0.0;
            for &(d, s, p) in transitions {
                if d == dst {
                    acc += p * pi[s];
                }
            }
            worst = worst.max((acc - pi[dst]).abs());
        }
        worst
    }

    #[test]
    fn single_state_is_trivial() {
        let m = equilibrium_system(1, &[(0, 0, 1.0)]);
        assert_eq!(m.solve().unwrap(), vec![1.0]);
    }

    #[test]
    fn symmetric_two_state_chain() {
        let t = [(0, 0, 0.5), (0, 1, 0.5), (1, 0, 0.5), (1, 1, 0.5)];
        let pi = equilibrium_system(2, &t).solve().unwrap();
        assert!((pi[0] - 0.5).abs() < 1e-12);
        assert!((pi[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn biased_two_state_chain() {
        // Both states jump to 0 with probability 0.7.
        let t = [(0, 0, 0.7), (0, 1, 0.7), (1, 0, 0.3), (1, 1, 0.3)];
        let pi = equilibrium_system(2, &t).solve().unwrap();
        assert!((pi[0] - 0.7).abs() < 1e-12);
        assert!((pi[1] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn three_state_cycle() {
        let t = [(1, 0, 1.0), (2, 1, 1.0), (0, 2, 1.0)];
        let pi = equilibrium_system(3, &t).solve().unwrap();
        for p in &pi {
            assert!((p - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn five_state_dense_chain_normalizes() {
        // Rows of a doubly stochastic 5x5 matrix.
        let mut t = Vec::new();
        let n = 5;
        for src in 0..n {
            for dst in 0..n {
                let p = if src == dst { 0.6 } else { 0.1 };
                t.push((dst, src, p));
            }
        }
        let pi = equilibrium_system(n, &t).solve().unwrap();
        let sum: f64 = pi.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(residual(n, &t, &pi) < 1e-9);
        for p in &pi {
            assert!((p - 0.2).abs() < 1e-9);
        }
    }

    #[test]
    fn singular_system_detected() {
        // Two absorbing states: the chain has no unique equilibrium.
        let t = [(0, 0, 1.0), (1, 1, 1.0)];
        let m = equilibrium_system(2, &t);
        // Row 0 carries only a zero after the diagonal shift cancels.
        assert!(matches!(m.solve(), Err(AnalysisError::SingularSystem(_))));
    }

    #[test]
    fn get_set_round_trip() {
        let mut m = SparseMatrix::new(3);
        m.set(0, 2, 4.5);
        m.set(0, 1, -1.0);
        assert_eq!(m.get(0, 2), 4.5);
        assert_eq!(m.get(0, 1), -1.0);
        assert_eq!(m.get(0, 0), 0.0);
        m.set(0, 2, 2.0);
        assert_eq!(m.get(0, 2), 2.0);
    }
}
