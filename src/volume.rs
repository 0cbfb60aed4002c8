use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use glam::{DMat3, DMat4, DVec3};
use half::f16;
use ndarray::{Array2, Array3, Array4, ArrayView4, Axis, s};
use tracing::debug;

use crate::display::DisplayProperties;
use crate::enums::{Orientation, ScalarType, VolumeKind};
use crate::error::ResliceError;
use crate::observer::Notifier;
use crate::timestamp::TimeStamp;
use crate::transform::ParentTransform;

/// Voxel element types that can be read as `f64`.
pub trait VoxelValue: Copy + Send + Sync + 'static {
    fn to_f64(self) -> f64;
}

macro_rules! impl_voxel_value {
    ($($ty:ty),*) => {
        $(impl VoxelValue for $ty {
            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }
        })*
    };
}

impl_voxel_value!(u8, i8, u16, i16, u32, i32, f32, f64, i64, u64);

impl VoxelValue for f16 {
    #[inline]
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
}

/// Scalar voxel buffer, indexed `[k, j, i, component]` (depth, height,
/// width, component).
#[derive(Debug, Clone, PartialEq)]
pub enum VoxelArray {
    U8(Array4<u8>),
    I8(Array4<i8>),
    U16(Array4<u16>),
    I16(Array4<i16>),
    U32(Array4<u32>),
    I32(Array4<i32>),
    F16(Array4<f16>),
    F32(Array4<f32>),
    F64(Array4<f64>),
    I64(Array4<i64>),
    U64(Array4<u64>),
}

macro_rules! dispatch {
    ($value:expr, $array:ident => $body:expr) => {
        match $value {
            VoxelArray::U8($array) => $body,
            VoxelArray::I8($array) => $body,
            VoxelArray::U16($array) => $body,
            VoxelArray::I16($array) => $body,
            VoxelArray::U32($array) => $body,
            VoxelArray::I32($array) => $body,
            VoxelArray::F16($array) => $body,
            VoxelArray::F32($array) => $body,
            VoxelArray::F64($array) => $body,
            VoxelArray::I64($array) => $body,
            VoxelArray::U64($array) => $body,
        }
    };
}
pub(crate) use dispatch;

impl VoxelArray {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            VoxelArray::U8(_) => ScalarType::U8,
            VoxelArray::I8(_) => ScalarType::I8,
            VoxelArray::U16(_) => ScalarType::U16,
            VoxelArray::I16(_) => ScalarType::I16,
            VoxelArray::U32(_) => ScalarType::U32,
            VoxelArray::I32(_) => ScalarType::I32,
            VoxelArray::F16(_) => ScalarType::F16,
            VoxelArray::F32(_) => ScalarType::F32,
            VoxelArray::F64(_) => ScalarType::F64,
            VoxelArray::I64(_) => ScalarType::I64,
            VoxelArray::U64(_) => ScalarType::U64,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        let (depth, height, width, _) = dispatch!(self, array => array.dim());
        (depth, height, width)
    }

    pub fn components(&self) -> usize {
        dispatch!(self, array => array.dim().3)
    }

    pub fn value(&self, k: usize, j: usize, i: usize, component: usize) -> f64 {
        dispatch!(self, array => array[[k, j, i, component]].to_f64())
    }

    /// Minimum and maximum of one component, `None` for an empty buffer.
    pub fn range(&self, component: usize) -> Option<(f64, f64)> {
        dispatch!(self, array => range_of(array.view(), component))
    }
}

fn range_of<T: VoxelValue>(array: ArrayView4<'_, T>, component: usize) -> Option<(f64, f64)> {
    if component >= array.dim().3 {
        return None;
    }
    array
        .index_axis(Axis(3), component)
        .iter()
        .map(|v| v.to_f64())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

macro_rules! impl_from_array3 {
    ($($ty:ty => $variant:ident),*) => {
        $(impl From<Array3<$ty>> for VoxelArray {
            fn from(data: Array3<$ty>) -> Self {
                VoxelArray::$variant(data.insert_axis(Axis(3)))
            }
        }
        impl From<Array4<$ty>> for VoxelArray {
            fn from(data: Array4<$ty>) -> Self {
                VoxelArray::$variant(data)
            }
        })*
    };
}

impl_from_array3!(
    u8 => U8, i8 => I8, u16 => U16, i16 => I16, u32 => U32, i32 => I32,
    f16 => F16, f32 => F32, f64 => F64, i64 => I64, u64 => U64
);

/// Voxel buffer plus the optional diffusion tensor field.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    scalars: VoxelArray,
    tensors: Option<Array4<f32>>,
}

impl ImageData {
    /// # Errors
    ///
    /// Returns [`ResliceError::EmptyVolume`] if any axis has zero length.
    pub fn new(scalars: impl Into<VoxelArray>) -> Result<Self, ResliceError> {
        let scalars = scalars.into();
        let dim = scalars.dim();
        if dim.0 == 0 || dim.1 == 0 || dim.2 == 0 || scalars.components() == 0 {
            return Err(ResliceError::EmptyVolume(dim));
        }
        Ok(Self {
            scalars,
            tensors: None,
        })
    }

    /// Attach a tensor field, one 3×3 tensor (row-major, 9 values) per voxel.
    pub fn with_tensors(mut self, tensors: Array4<f32>) -> Result<Self, ResliceError> {
        let (depth, height, width) = self.scalars.dim();
        let expected = [depth, height, width, 9];
        if tensors.shape() != expected {
            return Err(ResliceError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: tensors.shape().to_vec(),
            });
        }
        self.tensors = Some(tensors);
        Ok(self)
    }

    pub fn scalars(&self) -> &VoxelArray {
        &self.scalars
    }

    pub fn tensors(&self) -> Option<&Array4<f32>> {
        self.tensors.as_ref()
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.scalars.dim()
    }

    pub fn scalar_range(&self) -> Option<(f64, f64)> {
        self.scalars.range(0)
    }
}

/// A volume as seen by the slice pipeline.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
    kind: VolumeKind,
    image: Option<Arc<ImageData>>,
    ijk_to_ras: DMat4,
    parent_transform: Option<ParentTransform>,
    display: Option<DisplayProperties>,
}

impl Volume {
    pub fn new(id: impl Into<String>, kind: VolumeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            image: None,
            ijk_to_ras: DMat4::IDENTITY,
            parent_transform: None,
            display: None,
        }
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.image = Some(Arc::new(image));
        self
    }

    pub fn with_ijk_to_ras(mut self, ijk_to_ras: DMat4) -> Self {
        self.ijk_to_ras = ijk_to_ras;
        self
    }

    /// Build IJK→RAS from an origin, per-axis spacing `(i, j, k)` and
    /// direction cosines (columns = voxel axes in RAS).
    pub fn with_geometry(mut self, origin: DVec3, spacing: DVec3, directions: DMat3) -> Self {
        self.ijk_to_ras =
            DMat4::from_translation(origin) * DMat4::from_mat3(directions) * DMat4::from_scale(spacing);
        self
    }

    pub fn with_parent_transform(mut self, transform: ParentTransform) -> Self {
        self.parent_transform = Some(transform);
        self
    }

    pub fn with_display(mut self, display: DisplayProperties) -> Self {
        self.display = Some(display);
        self
    }

    pub fn kind(&self) -> VolumeKind {
        self.kind
    }

    pub fn image(&self) -> Option<&Arc<ImageData>> {
        self.image.as_ref()
    }

    pub fn ijk_to_ras(&self) -> DMat4 {
        self.ijk_to_ras
    }

    /// # Errors
    ///
    /// Returns [`ResliceError::SingularMatrix`] if IJK→RAS cannot be inverted.
    pub fn ras_to_ijk(&self) -> Result<DMat4, ResliceError> {
        if self.ijk_to_ras.determinant().abs() < f64::EPSILON {
            return Err(ResliceError::SingularMatrix("IJK to RAS"));
        }
        Ok(self.ijk_to_ras.inverse())
    }

    pub fn parent_transform(&self) -> Option<&ParentTransform> {
        self.parent_transform.as_ref()
    }

    pub fn display(&self) -> Option<&DisplayProperties> {
        self.display.as_ref()
    }

    /// Voxel spacing along i, j and k.
    pub fn spacing(&self) -> DVec3 {
        DVec3::new(
            self.ijk_to_ras.x_axis.truncate().length(),
            self.ijk_to_ras.y_axis.truncate().length(),
            self.ijk_to_ras.z_axis.truncate().length(),
        )
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> Option<(usize, usize, usize)> {
        self.image.as_ref().map(|image| image.dim())
    }

    /// IJK→world, including a linear parent transform. Non-linear parents
    /// are ignored.
    pub fn ijk_to_world(&self) -> DMat4 {
        match &self.parent_transform {
            Some(ParentTransform::Linear { to_world }) => *to_world * self.ijk_to_ras,
            _ => self.ijk_to_ras,
        }
    }

    /// Axis-aligned slice of the first component, read straight from the
    /// voxel grid.
    pub fn axis_slice(&self, index: usize, orientation: Orientation) -> Option<Array2<f64>> {
        let image = self.image.as_ref()?;
        let (depth, height, width) = image.dim();
        let max_index = match orientation {
            Orientation::Axial => depth,
            Orientation::Coronal => height,
            Orientation::Sagittal => width,
            Orientation::Reformat => return None,
        };
        if index >= max_index {
            return None;
        }
        dispatch!(image.scalars(), array => {
            let slice = match orientation {
                Orientation::Axial => array.slice(s![index, .., .., 0]),
                Orientation::Coronal => array.slice(s![.., index, .., 0]),
                _ => array.slice(s![.., .., index, 0]),
            };
            Some(slice.mapv(|v| v.to_f64()))
        })
    }
}

/// What changed on a [`VolumeNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeEvent {
    Modified,
    TransformModified,
    DisplayModified,
}

/// Shared handle on a volume with change notification.
///
/// The scene holds the strong reference; slice layers keep a
/// [`VolumeBinding`] so a removed volume stops being drawn.
#[derive(Debug)]
pub struct VolumeNode {
    volume: RefCell<Volume>,
    events: Notifier<VolumeEvent>,
    mtime: Cell<TimeStamp>,
}

impl VolumeNode {
    pub fn new(mut volume: Volume) -> Rc<Self> {
        if let Some(display) = volume.display.as_mut() {
            Self::refresh_auto_levels(display, volume.image.as_deref());
        }
        Rc::new(Self {
            volume: RefCell::new(volume),
            events: Notifier::new(),
            mtime: Cell::new(TimeStamp::now()),
        })
    }

    pub fn id(&self) -> String {
        self.volume.borrow().id.clone()
    }

    pub fn borrow(&self) -> Ref<'_, Volume> {
        self.volume.borrow()
    }

    pub fn events(&self) -> &Notifier<VolumeEvent> {
        &self.events
    }

    pub fn mtime(&self) -> TimeStamp {
        self.mtime.get()
    }

    pub fn set_image(&self, image: ImageData) {
        {
            let mut volume = self.volume.borrow_mut();
            volume.image = Some(Arc::new(image));
            let image = volume.image.clone();
            if let Some(display) = volume.display.as_mut() {
                Self::refresh_auto_levels(display, image.as_deref());
            }
        }
        self.mtime.set(TimeStamp::now());
        self.events.emit(VolumeEvent::Modified);
    }

    pub fn set_ijk_to_ras(&self, ijk_to_ras: DMat4) {
        {
            let mut volume = self.volume.borrow_mut();
            if volume.ijk_to_ras == ijk_to_ras {
                return;
            }
            volume.ijk_to_ras = ijk_to_ras;
        }
        self.mtime.set(TimeStamp::now());
        self.events.emit(VolumeEvent::Modified);
    }

    pub fn set_parent_transform(&self, transform: Option<ParentTransform>) {
        self.volume.borrow_mut().parent_transform = transform;
        self.mtime.set(TimeStamp::now());
        self.events.emit(VolumeEvent::TransformModified);
    }

    /// Edit the display properties in place. Does nothing if the volume has
    /// none yet.
    pub fn modify_display(&self, edit: impl FnOnce(&mut DisplayProperties)) {
        {
            let mut volume = self.volume.borrow_mut();
            let image = volume.image.clone();
            let Some(display) = volume.display.as_mut() else {
                return;
            };
            let before = display.clone();
            edit(display);
            Self::refresh_auto_levels(display, image.as_deref());
            if *display == before {
                return;
            }
        }
        self.events.emit(VolumeEvent::DisplayModified);
    }

    /// Attach display properties matching the volume kind if there are none.
    ///
    /// Returns `true` when properties were created.
    pub fn ensure_display(&self) -> bool {
        {
            let mut volume = self.volume.borrow_mut();
            if volume.display.is_some() {
                return false;
            }
            debug!(volume = %volume.id, kind = ?volume.kind, "volume has no display properties, adding one");
            let mut display = DisplayProperties::for_kind(volume.kind);
            Self::refresh_auto_levels(&mut display, volume.image.as_deref());
            volume.display = Some(display);
        }
        self.events.emit(VolumeEvent::DisplayModified);
        true
    }

    fn refresh_auto_levels(display: &mut DisplayProperties, image: Option<&ImageData>) {
        if let Some(range) = image.and_then(|image| image.scalar_range()) {
            display.apply_auto_levels(range);
        }
    }
}

/// Non-owning reference from a layer to a volume.
#[derive(Debug, Clone, Default)]
pub struct VolumeBinding {
    volume: Option<std::rc::Weak<VolumeNode>>,
}

impl VolumeBinding {
    pub fn new(volume: &Rc<VolumeNode>) -> Self {
        Self {
            volume: Some(Rc::downgrade(volume)),
        }
    }

    /// The bound volume, `None` if nothing is bound or it was removed.
    pub fn get(&self) -> Option<Rc<VolumeNode>> {
        self.volume.as_ref().and_then(|weak| weak.upgrade())
    }

    pub fn is_bound_to(&self, volume: Option<&Rc<VolumeNode>>) -> bool {
        match (&self.volume, volume) {
            (None, None) => true,
            (Some(weak), Some(volume)) => std::ptr::eq(weak.as_ptr(), Rc::as_ptr(volume)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(depth: usize, height: usize, width: usize) -> Array3<u16> {
        Array3::from_shape_fn((depth, height, width), |(k, j, i)| (k * 100 + j * 10 + i) as u16)
    }

    #[test]
    fn test_image_data_rejects_empty() {
        let empty = Array3::<u8>::zeros((0, 4, 4));
        assert!(matches!(ImageData::new(empty), Err(ResliceError::EmptyVolume(_))));
    }

    #[test]
    fn test_tensor_shape_checked() {
        let image = ImageData::new(ramp(2, 3, 4)).unwrap();
        let wrong = Array4::<f32>::zeros((2, 3, 4, 6));
        assert!(matches!(
            image.clone().with_tensors(wrong),
            Err(ResliceError::ShapeMismatch { .. })
        ));
        let right = Array4::<f32>::zeros((2, 3, 4, 9));
        assert!(image.with_tensors(right).unwrap().tensors().is_some());
    }

    #[test]
    fn test_voxel_array_access() {
        let array = VoxelArray::from(ramp(2, 3, 4));
        assert_eq!(array.scalar_type(), ScalarType::U16);
        assert_eq!(array.dim(), (2, 3, 4));
        assert_eq!(array.components(), 1);
        assert_eq!(array.value(1, 2, 3, 0), 123.0);
        assert_eq!(array.range(0), Some((0.0, 123.0)));
        assert_eq!(array.range(1), None);
    }

    #[test]
    fn test_half_precision_values() {
        let data = Array3::from_elem((1, 1, 2), f16::from_f32(1.5));
        let array = VoxelArray::from(data);
        assert_eq!(array.scalar_type(), ScalarType::F16);
        assert_eq!(array.value(0, 0, 1, 0), 1.5);
    }

    #[test]
    fn test_axis_slice_matches_voxels() {
        let volume = Volume::new("v", VolumeKind::Scalar).with_image(ImageData::new(ramp(2, 3, 4)).unwrap());
        let axial = volume.axis_slice(1, Orientation::Axial).unwrap();
        assert_eq!(axial.dim(), (3, 4));
        assert_eq!(axial[[2, 3]], 123.0);
        let sagittal = volume.axis_slice(3, Orientation::Sagittal).unwrap();
        assert_eq!(sagittal.dim(), (2, 3));
        assert!(volume.axis_slice(4, Orientation::Sagittal).is_none());
    }

    #[test]
    fn test_geometry_and_spacing() {
        let volume = Volume::new("v", VolumeKind::Scalar).with_geometry(
            DVec3::new(10.0, 20.0, 30.0),
            DVec3::new(0.5, 0.5, 2.0),
            DMat3::IDENTITY,
        );
        assert_eq!(volume.spacing(), DVec3::new(0.5, 0.5, 2.0));
        let ras = volume.ijk_to_ras().transform_point3(DVec3::new(2.0, 2.0, 1.0));
        assert_eq!(ras, DVec3::new(11.0, 21.0, 32.0));
        let back = volume.ras_to_ijk().unwrap().transform_point3(ras);
        assert!(back.abs_diff_eq(DVec3::new(2.0, 2.0, 1.0), 1e-12));
    }

    #[test]
    fn test_ensure_display_by_kind() {
        let node = VolumeNode::new(
            Volume::new("labels", VolumeKind::Label).with_image(ImageData::new(ramp(1, 2, 2)).unwrap()),
        );
        assert!(node.borrow().display().is_none());
        assert!(node.ensure_display());
        assert!(!node.ensure_display());
        assert!(node.borrow().display().unwrap().is_label_map());
    }

    #[test]
    fn test_binding_invalidated_on_drop() {
        let node = VolumeNode::new(Volume::new("v", VolumeKind::Scalar));
        let binding = VolumeBinding::new(&node);
        assert!(binding.get().is_some());
        assert!(binding.is_bound_to(Some(&node)));
        drop(node);
        assert!(binding.get().is_none());
    }
}
