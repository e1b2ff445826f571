//! Geometry utilities: rigid and similarity transforms, PnP, two-view
//! reconstruction and triangulation.

pub mod pnp;
pub mod se3;
pub mod sim3;
pub mod so3;
pub mod two_view;

use nalgebra::{DMatrix, DVector};

pub use pnp::{solve_pnp_ransac, PnPConfig, PnPResult};
pub use se3::SE3;
pub use sim3::Sim3;
pub use so3::skew;
pub use two_view::{reconstruct_two_view, triangulate_dlt, TwoViewConfig, TwoViewResult};

/// Unit vector minimizing `|A x|`, i.e. the eigenvector of `AᵀA` with the
/// smallest eigenvalue.
///
/// Working on `AᵀA` keeps this well defined for systems with fewer rows than
/// unknowns (an 8-point essential estimate has 8 rows and 9 unknowns).
pub(crate) fn smallest_eigenvector(a: &DMatrix<f64>) -> Option<DVector<f64>> {
    if a.ncols() == 0 {
        return None;
    }
    let ata = a.transpose() * a;
    let eigen = ata.symmetric_eigen();
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    Some(eigen.eigenvectors.column(min_idx).into_owned())
}
