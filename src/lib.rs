//! # Volume reslice library
//!
//! This crate renders arbitrary planes ("slices") through 3D medical
//! volumes and composites up to three of them into one view:
//!  - Background: usually the anatomical scan
//!  - Foreground: a second scan blended on top
//!  - Label: a segmentation drawn last, optionally as outlines
//!
//! Every view is described by a slice node (where the plane is and how many
//! pixels it has) and a composite node (which volumes go on which layer and
//! how they blend). A [`SliceCompositor`] observes both, reslices each bound
//! volume through its own transform chain (screen → RAS → parent transform →
//! voxel index) and caches the result until an input actually changes.
//! Resampling runs in parallel using rayon.
//!
//! Views can be linked. A [`SliceLinkBroadcaster`] replays interactive edits
//! of one slice view on all other views of the same view group, and a
//! [`ViewLinkBroadcaster`] does the same for 3D camera views.
//!
//!   Contributions are highly welcome!
//!
//! # Roadmap
//!
//!  - Cubic interpolation
//!  - GPU resampling of the UVW texture
//!
//! # Examples
//!
//! ## Showing the center of a volume in an axial view
//!
//! ```
//! # use volume_reslice::{Config, ImageData, Resolution, Scene, SliceCompositor, Volume, VolumeKind};
//! # use glam::{DMat3, DVec3};
//! # use ndarray::Array3;
//! let scene = Scene::new(Config::default());
//! let voxels = Array3::from_shape_fn((32, 64, 64), |(k, j, i)| (i + j + k) as u16);
//! scene.add_volume(
//!     Volume::new("ct", VolumeKind::Scalar)
//!         .with_image(ImageData::new(voxels)?)
//!         .with_geometry(DVec3::ZERO, DVec3::ONE, DMat3::IDENTITY),
//! );
//!
//! let compositor = SliceCompositor::new(&scene, "Red");
//! compositor
//!     .composite_node()
//!     .modify(|c| c.background_volume_id = Some("ct".into()));
//! compositor.fit_slice_to_all(256, 256);
//!
//! let image = compositor
//!     .composited_image(Resolution::Xy)
//!     .expect("should have composited the background");
//! assert_eq!(image.dimensions(), (256, 256));
//! # Ok::<(), volume_reslice::ResliceError>(())
//! ```

pub mod blend;
pub mod composite_node;
pub mod compositor;
pub mod config;
pub mod display;
pub mod enums;
pub mod error;
pub mod guard;
mod interpolator;
pub mod label_outline;
pub mod node;
pub mod observer;
pub mod reslice;
pub mod scene;
pub mod slice_layer;
pub mod slice_link;
pub mod slice_node;
pub mod timestamp;
pub mod transform;
pub mod view_link;
pub mod view_node;
pub mod volume;

pub use compositor::{CompositorEvent, CompositorRegistry, SliceCompositor, SliceIndex, SliceOffsetRange, SlicePlane};
pub use config::Config;
pub use enums::{
    BlendMode, Interpolation, LayerKind, Orientation, Resolution, ResolutionMode, ScalarType, VolumeKind,
};
pub use error::ResliceError;
pub use scene::{BatchKind, Scene};
pub use slice_layer::SliceLayer;
pub use slice_link::{SliceActions, SliceLinkBroadcaster};
pub use transform::{ParentTransform, WarpField, XyToIjk};
pub use view_link::ViewLinkBroadcaster;
pub use volume::{ImageData, Volume, VolumeNode};
