// src/linalg_backends.rs

use crate::error::ThreadSafeStdError;
use ndarray::{s, Array1, Array2};
use std::marker::PhantomData;

/// Dispatches to the linear algebra backend selected by feature flags.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

/// Output of a Singular Value Decomposition.
///
/// For a thin decomposition of an (m x n) matrix with k = min(m, n):
/// `u` is (m x k), `s` has length k and `vt` is (k x n).
/// For a full decomposition `u` is (m x m) and `vt` is (n x n); `s` still has length k.
#[derive(Debug)]
pub struct SVDOutput<F: 'static> {
    pub u: Array2<F>,
    pub s: Array1<F>,
    pub vt: Array2<F>,
}

/// Singular Value Decomposition, singular values in descending order.
pub trait BackendSVD<F: 'static + Copy + Send + Sync> {
    /// Economy-size decomposition.
    fn thin_svd(&self, matrix: Array2<F>) -> Result<SVDOutput<F>, ThreadSafeStdError>;

    /// Decomposition with square `u` and `vt`, needed when the orthogonal
    /// complement of the row or column space is required.
    fn full_svd(&self, matrix: Array2<F>) -> Result<SVDOutput<F>, ThreadSafeStdError>;
}

// --- ndarray-linalg (LAPACK) backend ---
use ndarray_linalg::SVDInto as NdLinalgSVDInto;

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> ThreadSafeStdError {
    Box::new(e)
}

fn empty_svd(nrows: usize, ncols: usize, full: bool) -> SVDOutput<f64> {
    let k = nrows.min(ncols);
    if full {
        SVDOutput {
            u: Array2::eye(nrows),
            s: Array1::zeros(k),
            vt: Array2::eye(ncols),
        }
    } else {
        SVDOutput {
            u: Array2::zeros((nrows, k)),
            s: Array1::zeros(k),
            vt: Array2::zeros((k, ncols)),
        }
    }
}

impl BackendSVD<f64> for NdarrayLinAlgBackend {
    fn thin_svd(&self, matrix: Array2<f64>) -> Result<SVDOutput<f64>, ThreadSafeStdError> {
        let (nrows, ncols) = matrix.dim();
        if matrix.is_empty() {
            return Ok(empty_svd(nrows, ncols, false));
        }
        let k = nrows.min(ncols);
        // gesvd hands back square factors; keep the leading k singular vectors.
        let full = self.full_svd(matrix)?;
        Ok(SVDOutput {
            u: full.u.slice(s![.., ..k]).to_owned(),
            s: full.s,
            vt: full.vt.slice(s![..k, ..]).to_owned(),
        })
    }

    fn full_svd(&self, matrix: Array2<f64>) -> Result<SVDOutput<f64>, ThreadSafeStdError> {
        let (nrows, ncols) = matrix.dim();
        if matrix.is_empty() {
            return Ok(empty_svd(nrows, ncols, true));
        }
        let (u, s, vt) = matrix.svd_into(true, true).map_err(to_dyn_error)?;
        let u = u.ok_or("LAPACK SVD returned no left singular vectors")?;
        let vt = vt.ok_or("LAPACK SVD returned no right singular vectors")?;
        Ok(SVDOutput { u, s, vt })
    }
}

// --- faer backend ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{empty_svd, BackendSVD, SVDOutput};
    use crate::error::ThreadSafeStdError;
    use bytemuck::Pod;
    use faer::linalg::solvers::Svd as FaerSolverSvd;
    use faer::traits::num_traits::Zero;
    use faer::traits::ComplexField;
    use faer::MatRef;
    use ndarray::{Array1, Array2, ShapeBuilder};

    fn to_dyn_error_faer(msg: String) -> ThreadSafeStdError {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    fn faer_mat_to_ndarray<F: ComplexField + Copy + Pod + Zero>(faer_mat: MatRef<'_, F>) -> Array2<F> {
        let nrows = faer_mat.nrows();
        let ncols = faer_mat.ncols();
        let mut data_vec = Vec::with_capacity(nrows * ncols);
        for j in 0..ncols {
            for i in 0..nrows {
                data_vec.push(faer_mat[(i, j)]);
            }
        }
        Array2::from_shape_vec((nrows, ncols).f(), data_vec).unwrap_or_else(|_| Array2::zeros((nrows, ncols)))
    }

    fn faer_col_to_ndarray_vec<F: ComplexField + Copy + Pod + Zero>(faer_col: faer::ColRef<'_, F>) -> Array1<F> {
        Array1::from_iter((0..faer_col.nrows()).map(|i| faer_col[i]))
    }

    fn view_as_faer(matrix: &Array2<f64>) -> Result<MatRef<'_, f64>, ThreadSafeStdError> {
        let (nrows, ncols) = matrix.dim();
        let slice = matrix.as_slice_memory_order().ok_or_else(|| {
            to_dyn_error_faer(format!(
                "Input ndarray matrix ({}x{}) is non-contiguous and cannot be viewed by faer.",
                nrows, ncols
            ))
        })?;
        if matrix.is_standard_layout() {
            Ok(MatRef::from_row_major_slice(slice, nrows, ncols))
        } else {
            Ok(MatRef::from_column_major_slice(slice, nrows, ncols))
        }
    }

    impl BackendSVD<f64> for FaerLinAlgBackend {
        fn thin_svd(&self, matrix: Array2<f64>) -> Result<SVDOutput<f64>, ThreadSafeStdError> {
            let (nrows, ncols) = matrix.dim();
            if matrix.is_empty() {
                return Ok(empty_svd(nrows, ncols, false));
            }
            let svd = FaerSolverSvd::new_thin(view_as_faer(&matrix)?)
                .map_err(|e| to_dyn_error_faer(format!("Faer thin SVD failed: {:?}", e)))?;
            Ok(SVDOutput {
                u: faer_mat_to_ndarray(svd.U().as_ref()),
                s: faer_col_to_ndarray_vec(svd.S().column_vector()),
                vt: faer_mat_to_ndarray(svd.V().as_ref()).t().to_owned(),
            })
        }

        fn full_svd(&self, matrix: Array2<f64>) -> Result<SVDOutput<f64>, ThreadSafeStdError> {
            let (nrows, ncols) = matrix.dim();
            if matrix.is_empty() {
                return Ok(empty_svd(nrows, ncols, true));
            }
            let svd = FaerSolverSvd::new(view_as_faer(&matrix)?)
                .map_err(|e| to_dyn_error_faer(format!("Faer full SVD failed: {:?}", e)))?;
            let k = nrows.min(ncols);
            let s_full = faer_col_to_ndarray_vec(svd.S().column_vector());
            Ok(SVDOutput {
                u: faer_mat_to_ndarray(svd.U().as_ref()),
                s: s_full.slice(ndarray::s![..k]).to_owned(),
                vt: faer_mat_to_ndarray(svd.V().as_ref()).t().to_owned(),
            })
        }
    }
}

#[cfg(feature = "backend_faer")]
impl<F> BackendSVD<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendSVD<F>,
    faer_specific_code::FaerLinAlgBackend: BackendSVD<F>,
{
    fn thin_svd(&self, matrix: Array2<F>) -> Result<SVDOutput<F>, ThreadSafeStdError> {
        faer_specific_code::FaerLinAlgBackend.thin_svd(matrix)
    }

    fn full_svd(&self, matrix: Array2<F>) -> Result<SVDOutput<F>, ThreadSafeStdError> {
        faer_specific_code::FaerLinAlgBackend.full_svd(matrix)
    }
}

#[cfg(not(feature = "backend_faer"))]
impl<F> BackendSVD<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendSVD<F>,
{
    fn thin_svd(&self, matrix: Array2<F>) -> Result<SVDOutput<F>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.thin_svd(matrix)
    }

    fn full_svd(&self, matrix: Array2<F>) -> Result<SVDOutput<F>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.full_svd(matrix)
    }
}

/// Shorthand used by the kernels: thin SVD through the configured backend.
pub(crate) fn thin_svd(matrix: Array2<f64>) -> Result<SVDOutput<f64>, ThreadSafeStdError> {
    LinAlgBackendProvider::<f64>::new().thin_svd(matrix)
}

/// Shorthand used by the kernels: full SVD through the configured backend.
pub(crate) fn full_svd(matrix: Array2<f64>) -> Result<SVDOutput<f64>, ThreadSafeStdError> {
    LinAlgBackendProvider::<f64>::new().full_svd(matrix)
}
