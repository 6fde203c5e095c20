//! Embedding vectors and their normalization

use serde::{Deserialize, Serialize};

/// Embedding of one input text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Tokens the input was encoded to
    pub n_tokens: usize,
    /// Normalization mode applied to `values`
    pub normalize: i32,
}

/// Normalizes `values` in place.
///
/// Modes: -1 none, 0 max-absolute scaled to the int16 range, 1 taxicab,
/// 2 euclidean, anything larger a p-norm with that exponent.
pub fn normalize(values: &mut [f32], mode: i32) {
    let sum: f64 = match mode {
        m if m < 0 => return,
        0 => {
            let max = values.iter().fold(0.0f64, |acc, v| acc.max(v.abs() as f64));
            max / 32760.0
        }
        1 => values.iter().map(|v| v.abs() as f64).sum(),
        2 => values
            .iter()
            .map(|v| (*v as f64) * (*v as f64))
            .sum::<f64>()
            .sqrt(),
        p => {
            let p = p as f64;
            values
                .iter()
                .map(|v| (v.abs() as f64).powf(p))
                .sum::<f64>()
                .powf(1.0 / p)
        }
    };

    let norm = if sum > 0.0 { 1.0 / sum } else { 0.0 };
    for v in values.iter_mut() {
        *v = (*v as f64 * norm) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-4, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn test_euclidean() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v, 2);
        approx(&v, &[0.6, 0.8]);
    }

    #[test]
    fn test_taxicab() {
        let mut v = vec![1.0, -3.0];
        normalize(&mut v, 1);
        approx(&v, &[0.25, -0.75]);
    }

    #[test]
    fn test_max_abs_int16_range() {
        let mut v = vec![0.5, -2.0];
        normalize(&mut v, 0);
        approx(&v, &[8190.0, -32760.0]);
    }

    #[test]
    fn test_p_norm_and_none() {
        let mut v = vec![1.0, 1.0];
        normalize(&mut v, 3);
        let expected = 1.0 / 2f32.powf(1.0 / 3.0);
        approx(&v, &[expected, expected]);

        let mut v = vec![5.0, -1.0];
        normalize(&mut v, -1);
        approx(&v, &[5.0, -1.0]);
    }

    #[test]
    fn test_zero_vector_stays_zero() {
        let mut v = vec![0.0, 0.0];
        normalize(&mut v, 2);
        approx(&v, &[0.0, 0.0]);
    }
}
