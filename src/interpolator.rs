use glam::DVec3;
use ndarray::ArrayView4;

use crate::volume::VoxelValue;

/// Point samplers over a `[k, j, i, c]` voxel grid.
///
/// Coordinates are continuous voxel indices `(i, j, k)`. The grid is
/// extended by half a voxel on every side; samples in that border are
/// clamped to the edge voxels. Both samplers return `false` and leave `out`
/// untouched for points outside the extended grid.
pub(crate) struct Interpolator;

impl Interpolator {
    #[inline]
    fn inside(value: f64, len: usize) -> bool {
        value >= -0.5 && value <= len as f64 - 0.5
    }

    #[inline]
    pub(crate) fn nearest<T: VoxelValue>(volume: &ArrayView4<T>, ijk: DVec3, out: &mut [f64]) -> bool {
        let (depth, height, width, components) = volume.dim();
        if !Self::inside(ijk.x, width) || !Self::inside(ijk.y, height) || !Self::inside(ijk.z, depth) {
            return false;
        }

        let i = ((ijk.x + 0.5).floor().max(0.0) as usize).min(width - 1);
        let j = ((ijk.y + 0.5).floor().max(0.0) as usize).min(height - 1);
        let k = ((ijk.z + 0.5).floor().max(0.0) as usize).min(depth - 1);
        for (c, value) in out.iter_mut().enumerate().take(components) {
            *value = volume[[k, j, i, c]].to_f64();
        }
        true
    }

    #[inline]
    pub(crate) fn trilinear<T: VoxelValue>(volume: &ArrayView4<T>, ijk: DVec3, out: &mut [f64]) -> bool {
        let (depth, height, width, components) = volume.dim();
        if !Self::inside(ijk.x, width) || !Self::inside(ijk.y, height) || !Self::inside(ijk.z, depth) {
            return false;
        }

        let x = ijk.x.clamp(0.0, (width - 1) as f64);
        let y = ijk.y.clamp(0.0, (height - 1) as f64);
        let z = ijk.z.clamp(0.0, (depth - 1) as f64);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let z0 = z.floor() as usize;
        let x1 = (x0 + 1).min(width - 1);
        let y1 = (y0 + 1).min(height - 1);
        let z1 = (z0 + 1).min(depth - 1);

        let dx = x - x0 as f64;
        let dy = y - y0 as f64;
        let dz = z - z0 as f64;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;
        let one_minus_dz = 1.0 - dz;

        for (c, value) in out.iter_mut().enumerate().take(components) {
            let v000 = volume[[z0, y0, x0, c]].to_f64();
            let v001 = volume[[z0, y0, x1, c]].to_f64();
            let v010 = volume[[z0, y1, x0, c]].to_f64();
            let v011 = volume[[z0, y1, x1, c]].to_f64();
            let v100 = volume[[z1, y0, x0, c]].to_f64();
            let v101 = volume[[z1, y0, x1, c]].to_f64();
            let v110 = volume[[z1, y1, x0, c]].to_f64();
            let v111 = volume[[z1, y1, x1, c]].to_f64();

            let v00 = v000.mul_add(one_minus_dx, v001 * dx);
            let v01 = v010.mul_add(one_minus_dx, v011 * dx);
            let v10 = v100.mul_add(one_minus_dx, v101 * dx);
            let v11 = v110.mul_add(one_minus_dx, v111 * dx);

            let v0 = v00.mul_add(one_minus_dy, v01 * dy);
            let v1 = v10.mul_add(one_minus_dy, v11 * dy);

            *value = v0.mul_add(one_minus_dz, v1 * dz);
        }
        true
    }
}
