use crate::error::AlignmentError;
use ndarray::{ArrayView2, Zip};

/// R^2 against a zero-mean baseline, averaged uniformly over columns.
///
/// Each column scores `1 - ||y - y_hat||^2 / ||y||^2`. A column predicted
/// perfectly scores 1 even when it is all zero; a column that is all zero but
/// predicted with error scores 0.
pub fn zero_mean_coefficient_determination(
    y_true: ArrayView2<f64>,
    y_pred: ArrayView2<f64>,
) -> Result<f64, AlignmentError> {
    if y_true.dim() != y_pred.dim() {
        let (expected, found) = if y_true.nrows() != y_pred.nrows() {
            (y_true.nrows(), y_pred.nrows())
        } else {
            (y_true.ncols(), y_pred.ncols())
        };
        return Err(AlignmentError::shape("score shape", expected, found));
    }
    if y_true.ncols() == 0 {
        return Err(AlignmentError::InvalidInput("cannot score signals without columns".to_string()));
    }

    let total: f64 = Zip::from(y_true.columns())
        .and(y_pred.columns())
        .map_collect(|truth, prediction| {
            let (numerator, denominator) = Zip::from(&truth)
                .and(&prediction)
                .fold((0.0, 0.0), |(num, den), &t, &p| (num + (t - p) * (t - p), den + t * t));
            if numerator == 0.0 {
                1.0
            } else if denominator == 0.0 {
                0.0
            } else {
                1.0 - numerator / denominator
            }
        })
        .sum();
    Ok(total / y_true.ncols() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use ndarray::array;

    #[test]
    fn perfect_and_degenerate_columns() {
        let truth = array![[1.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        let prediction = array![[1.0, 0.0, 1.0], [2.0, 0.0, 0.0]];
        let score = zero_mean_coefficient_determination(truth.view(), prediction.view()).unwrap();
        assert!(approx_eq!(f64, score, 2.0 / 3.0, ulps = 4));
    }

    #[test]
    fn zero_prediction_scores_zero() {
        let truth = array![[1.0, -3.0], [2.0, 4.0]];
        let prediction = ndarray::Array2::<f64>::zeros((2, 2));
        let score = zero_mean_coefficient_determination(truth.view(), prediction.view()).unwrap();
        assert!(approx_eq!(f64, score, 0.0, epsilon = 1e-15));
    }
}
