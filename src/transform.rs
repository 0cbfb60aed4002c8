//! Screen → IJK coordinate chains.
//!
//! Every resample path maps an output pixel `(x, y, z)` to a continuous
//! voxel index. The chain is `RAS→IJK · world→local · screen→RAS`. When every
//! piece is linear the chain collapses into one matrix; a non-linear parent
//! transform keeps the pieces separate and is applied per point.

use std::fmt;
use std::sync::Arc;

use glam::{DMat4, DVec3};

use crate::error::ResliceError;

/// A non-linear world→local mapping (e.g. a displacement grid).
pub trait WarpField: Send + Sync + fmt::Debug {
    fn world_to_local(&self, world: DVec3) -> DVec3;

    /// The equivalent matrix if the warp happens to be linear.
    fn as_linear(&self) -> Option<DMat4> {
        None
    }
}

/// Transform between a volume's local RAS frame and the world.
#[derive(Debug, Clone)]
pub enum ParentTransform {
    Linear { to_world: DMat4 },
    Warp(Arc<dyn WarpField>),
}

impl ParentTransform {
    pub fn is_linear(&self) -> bool {
        match self {
            ParentTransform::Linear { .. } => true,
            ParentTransform::Warp(warp) => warp.as_linear().is_some(),
        }
    }

    /// World→local as a matrix, or `None` for a true warp.
    ///
    /// # Errors
    ///
    /// Returns [`ResliceError::SingularMatrix`] if a linear parent cannot be
    /// inverted.
    pub fn world_to_local_matrix(&self) -> Result<Option<DMat4>, ResliceError> {
        match self {
            ParentTransform::Linear { to_world } => {
                if to_world.determinant().abs() < f64::EPSILON {
                    return Err(ResliceError::SingularMatrix("parent to world"));
                }
                Ok(Some(to_world.inverse()))
            }
            ParentTransform::Warp(warp) => Ok(warp.as_linear()),
        }
    }
}

/// Composed screen→IJK mapping of one resample path.
#[derive(Debug, Clone)]
pub enum XyToIjk {
    Linear {
        matrix: DMat4,
        /// Every axis of the output maps onto exactly one voxel axis
        permutation: bool,
    },
    General {
        screen_to_world: DMat4,
        warp: Arc<dyn WarpField>,
        local_to_ijk: DMat4,
    },
}

impl Default for XyToIjk {
    fn default() -> Self {
        XyToIjk::Linear {
            matrix: DMat4::IDENTITY,
            permutation: true,
        }
    }
}

impl PartialEq for XyToIjk {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                XyToIjk::Linear { matrix: a, permutation: pa },
                XyToIjk::Linear { matrix: b, permutation: pb },
            ) => a == b && pa == pb,
            (
                XyToIjk::General { screen_to_world: sa, warp: wa, local_to_ijk: la },
                XyToIjk::General { screen_to_world: sb, warp: wb, local_to_ijk: lb },
            ) => sa == sb && la == lb && Arc::ptr_eq(wa, wb),
            _ => false,
        }
    }
}

impl XyToIjk {
    /// Compose `ras_to_ijk · inverse(parent) · screen_to_ras`.
    ///
    /// Nearly axis-aligned linear chains are snapped to an exact permutation
    /// so the resampler can take its fast path.
    ///
    /// # Errors
    ///
    /// Propagates [`ResliceError::SingularMatrix`] from a linear parent.
    pub fn compose(
        screen_to_ras: DMat4,
        parent: Option<&ParentTransform>,
        ras_to_ijk: DMat4,
        suppression: f64,
    ) -> Result<Self, ResliceError> {
        let world_to_local = match parent {
            None => Some(DMat4::IDENTITY),
            Some(parent) => parent.world_to_local_matrix()?,
        };
        match (world_to_local, parent) {
            (Some(world_to_local), _) => {
                let matrix = ras_to_ijk * world_to_local * screen_to_ras;
                Ok(match snap_to_permutation(&matrix, suppression) {
                    Some(snapped) => XyToIjk::Linear {
                        matrix: snapped,
                        permutation: true,
                    },
                    None => XyToIjk::Linear {
                        matrix,
                        permutation: false,
                    },
                })
            }
            (None, Some(ParentTransform::Warp(warp))) => Ok(XyToIjk::General {
                screen_to_world: screen_to_ras,
                warp: Arc::clone(warp),
                local_to_ijk: ras_to_ijk,
            }),
            (None, _) => Ok(XyToIjk::default()),
        }
    }

    #[inline]
    pub fn map(&self, point: DVec3) -> DVec3 {
        match self {
            XyToIjk::Linear { matrix, .. } => matrix.transform_point3(point),
            XyToIjk::General {
                screen_to_world,
                warp,
                local_to_ijk,
            } => {
                let world = screen_to_world.transform_point3(point);
                local_to_ijk.transform_point3(warp.world_to_local(world))
            }
        }
    }

    pub fn linear_matrix(&self) -> Option<DMat4> {
        match self {
            XyToIjk::Linear { matrix, .. } => Some(*matrix),
            XyToIjk::General { .. } => None,
        }
    }

    pub fn is_permutation(&self) -> bool {
        matches!(self, XyToIjk::Linear { permutation: true, .. })
    }
}

/// Snap an almost-permutation affine matrix to an exact one.
///
/// Within each of the three spatial rows the dominant term is kept and every
/// other term must be below `suppression` times its magnitude; those are set
/// to zero. Returns `None` when the matrix is oblique, when two rows share a
/// dominant column, or when the last row is not `[0, 0, 0, 1]`. Snapping an
/// already snapped matrix returns it unchanged.
pub fn snap_to_permutation(matrix: &DMat4, suppression: f64) -> Option<DMat4> {
    // glam is column-major; work on rows.
    let mut rows = matrix.transpose().to_cols_array_2d();
    if rows[3] != [0.0, 0.0, 0.0, 1.0] {
        return None;
    }

    let mut used = [false; 3];
    for row in rows.iter_mut().take(3) {
        let dominant = (0..3).max_by(|&a, &b| row[a].abs().total_cmp(&row[b].abs()))?;
        let magnitude = row[dominant].abs();
        if magnitude == 0.0 || used[dominant] {
            return None;
        }
        for column in 0..3 {
            if column != dominant && row[column].abs() > suppression * magnitude {
                return None;
            }
        }
        used[dominant] = true;
        for column in 0..3 {
            if column != dominant {
                row[column] = 0.0;
            }
        }
    }
    Some(DMat4::from_cols_array_2d(&rows).transpose())
}
