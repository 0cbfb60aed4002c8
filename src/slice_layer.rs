//! One layer (background, foreground or label) of a slice view.
//!
//! A layer binds a volume and a slice node and keeps one resample path per
//! [`Resolution`]. Transforms are recomputed eagerly when an input reports a
//! change; the resampled raster is recomputed lazily in [`SliceLayer::output`]
//! once any of its input stamps is newer than the cached output.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use glam::DMat4;
use image::{GrayImage, RgbaImage};
use tracing::{debug, warn};

use crate::config::Config;
use crate::display::DisplayProperties;
use crate::enums::Resolution;
use crate::guard::ReentrancyCounter;
use crate::label_outline::label_outline;
use crate::node::NodeEvent;
use crate::observer::{Notifier, Priority, Subscription};
use crate::reslice::reslice;
use crate::slice_node::SliceNode;
use crate::timestamp::TimeStamp;
use crate::transform::XyToIjk;
use crate::volume::{VolumeBinding, VolumeEvent, VolumeNode};

/// Coloured resample result of one layer.
///
/// Frames of a lightbox view (output depth > 1) are stacked top to bottom.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerOutput {
    pub image: RgbaImage,
    pub stencil: Option<GrayImage>,
    pub mtime: TimeStamp,
}

#[derive(Debug, Default)]
struct ReslicePath {
    transform: XyToIjk,
    dimensions: [u32; 3],
    transform_mtime: TimeStamp,
    output: Option<Rc<LayerOutput>>,
    computed_at: TimeStamp,
}

#[derive(Debug, Default)]
struct LayerState {
    volume: VolumeBinding,
    slice: Option<Weak<SliceNode>>,
    is_label_layer: bool,
    outline_active: bool,
    label_mtime: TimeStamp,
    displays: [Option<DisplayProperties>; 2],
    display_mtime: TimeStamp,
    paths: [ReslicePath; 2],
    subscriptions: Vec<Subscription>,
}

impl LayerState {
    /// Mirror the volume's display properties into both private clones.
    fn sync_displays(&mut self, volume: Option<&VolumeNode>) -> bool {
        let source = volume.and_then(|volume| volume.borrow().display().map(DisplayProperties::slice_clone));
        let mut changed = false;
        for display in &mut self.displays {
            if *display != source {
                *display = source.clone();
                changed = true;
            }
        }
        if changed {
            self.display_mtime = TimeStamp::now();
        }
        changed
    }

    fn update_path(
        &mut self,
        resolution: Resolution,
        volume: Option<&VolumeNode>,
        slice: Option<&SliceNode>,
        config: &Config,
    ) -> bool {
        let (screen_to_ras, dimensions) = match (volume, slice) {
            (Some(_), Some(slice)) => {
                let state = slice.state();
                match resolution {
                    Resolution::Xy => (state.xy_to_ras(), state.dimensions()),
                    Resolution::Uvw => (state.uvw_to_ras(), state.uvw_dimensions()),
                }
            }
            _ => (DMat4::IDENTITY, config.default_dimensions),
        };

        let transform = match volume {
            None => XyToIjk::default(),
            Some(volume) => {
                let volume = volume.borrow();
                let composed = volume.ras_to_ijk().and_then(|ras_to_ijk| {
                    XyToIjk::compose(
                        screen_to_ras,
                        volume.parent_transform(),
                        ras_to_ijk,
                        config.permutation_suppression,
                    )
                });
                match composed {
                    Ok(transform) => transform,
                    Err(err) => {
                        warn!(volume = %volume.id, %err, "cannot build slice transform");
                        XyToIjk::default()
                    }
                }
            }
        };

        let path = &mut self.paths[resolution.index()];
        if path.transform == transform && path.dimensions == dimensions {
            return false;
        }
        if path.transform.linear_matrix().is_some() && transform.linear_matrix().is_none() {
            debug!(?resolution, "parent transform is not linear, using per-point resampling");
        }
        path.transform = transform;
        path.dimensions = dimensions;
        path.transform_mtime = TimeStamp::now();
        true
    }

    fn update_outline(&mut self, slice: Option<&SliceNode>) -> bool {
        let active = self.is_label_layer
            && self.displays[0].as_ref().is_some_and(DisplayProperties::is_label_map)
            && slice.is_some_and(|slice| slice.state().use_label_outline);
        if active == self.outline_active {
            return false;
        }
        self.outline_active = active;
        self.label_mtime = TimeStamp::now();
        true
    }
}

#[derive(Debug)]
pub struct SliceLayer {
    config: Config,
    state: RefCell<LayerState>,
    updating: ReentrancyCounter,
    events: Notifier<NodeEvent>,
    mtime: Cell<TimeStamp>,
    self_weak: Weak<SliceLayer>,
}

impl SliceLayer {
    pub fn new(config: Config) -> Rc<Self> {
        Rc::new_cyclic(|self_weak| Self {
            config,
            state: RefCell::new(LayerState::default()),
            updating: ReentrancyCounter::new(),
            events: Notifier::new(),
            mtime: Cell::new(TimeStamp::now()),
            self_weak: self_weak.clone(),
        })
    }

    pub fn events(&self) -> &Notifier<NodeEvent> {
        &self.events
    }

    pub fn mtime(&self) -> TimeStamp {
        self.mtime.get()
    }

    pub fn volume(&self) -> Option<Rc<VolumeNode>> {
        self.state.borrow().volume.get()
    }

    pub fn slice_node(&self) -> Option<Rc<SliceNode>> {
        self.state.borrow().slice.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_bound_to(&self, volume: Option<&Rc<VolumeNode>>) -> bool {
        let state = self.state.borrow();
        if volume.is_some() && state.volume.get().is_none() {
            return false;
        }
        state.volume.is_bound_to(volume)
    }

    /// Attach a volume and a slice node, replacing the previous ones.
    ///
    /// A volume without display properties gets a default set for its kind.
    pub fn bind(&self, volume: Option<&Rc<VolumeNode>>, slice: Option<&Rc<SliceNode>>) {
        let same_slice = match (self.slice_node(), slice) {
            (None, None) => true,
            (Some(a), Some(b)) => Rc::ptr_eq(&a, b),
            _ => false,
        };
        if self.is_bound_to(volume) && same_slice {
            return;
        }

        let mut subscriptions = Vec::new();
        if let Some(volume) = volume {
            let weak = self.self_weak.clone();
            subscriptions.push(volume.events().subscribe(Priority::Normal, move |event| {
                if let Some(layer) = weak.upgrade() {
                    layer.on_volume_event(*event);
                }
            }));
        }
        if let Some(slice) = slice {
            let weak = self.self_weak.clone();
            subscriptions.push(slice.events().subscribe(Priority::Normal, move |_| {
                if let Some(layer) = weak.upgrade() {
                    layer.on_upstream_modified(false);
                }
            }));
        }
        {
            let mut state = self.state.borrow_mut();
            state.volume = volume.map(VolumeBinding::new).unwrap_or_default();
            state.slice = slice.map(Rc::downgrade);
            state.subscriptions = subscriptions;
            for path in &mut state.paths {
                path.output = None;
            }
        }
        self.on_upstream_modified(true);
    }

    pub fn is_label_layer(&self) -> bool {
        self.state.borrow().is_label_layer
    }

    /// Mark this layer as the label layer. Outlining applies only to label
    /// layers showing a label map in a view that asks for outlines.
    pub fn set_label_layer(&self, is_label_layer: bool) {
        {
            let mut state = self.state.borrow_mut();
            if state.is_label_layer == is_label_layer {
                return;
            }
            state.is_label_layer = is_label_layer;
        }
        self.on_upstream_modified(true);
    }

    pub fn has_label_outline(&self) -> bool {
        self.state.borrow().outline_active
    }

    pub fn display(&self, resolution: Resolution) -> Option<DisplayProperties> {
        self.state.borrow().displays[resolution.index()].clone()
    }

    pub fn xy_to_ijk(&self, resolution: Resolution) -> XyToIjk {
        self.state.borrow().paths[resolution.index()].transform.clone()
    }

    pub fn dimensions(&self, resolution: Resolution) -> [u32; 3] {
        self.state.borrow().paths[resolution.index()].dimensions
    }

    pub fn transform_mtime(&self, resolution: Resolution) -> TimeStamp {
        self.state.borrow().paths[resolution.index()].transform_mtime
    }

    fn on_volume_event(&self, event: VolumeEvent) {
        self.on_upstream_modified(event == VolumeEvent::Modified);
    }

    fn on_upstream_modified(&self, force: bool) {
        if self.updating.is_active() {
            return;
        }
        if self.update_transforms() || force {
            self.mtime.set(TimeStamp::now());
            self.events.emit(NodeEvent::Modified);
        }
    }

    /// Recompute display clones, transforms and the outline flag.
    fn update_transforms(&self) -> bool {
        let Some(_guard) = self.updating.try_enter() else {
            return false;
        };
        let volume = self.volume();
        if let Some(volume) = &volume {
            volume.ensure_display();
        }
        let slice = self.slice_node();

        let mut state = self.state.borrow_mut();
        let mut changed = state.sync_displays(volume.as_deref());
        for resolution in Resolution::ALL {
            changed |= state.update_path(resolution, volume.as_deref(), slice.as_deref(), &self.config);
        }
        changed |= state.update_outline(slice.as_deref());
        changed
    }

    /// Current raster for `resolution`, `None` without a volume, image or
    /// display properties.
    pub fn output(&self, resolution: Resolution) -> Option<Rc<LayerOutput>> {
        let volume = self.volume()?;
        let index = resolution.index();
        let (display, transform, dimensions, outline) = {
            let state = self.state.borrow();
            let path = &state.paths[index];
            let newest_input = volume
                .mtime()
                .max(state.display_mtime)
                .max(state.label_mtime)
                .max(path.transform_mtime);
            if let Some(output) = &path.output {
                if path.computed_at > newest_input {
                    return Some(Rc::clone(output));
                }
            }
            (
                state.displays[index].clone(),
                path.transform.clone(),
                path.dimensions,
                state.outline_active,
            )
        };

        let output = display.and_then(|display| {
            let image = volume.borrow().image().cloned()?;
            let mut resliced = match reslice(
                &image,
                display.resample_channel(),
                &transform,
                dimensions,
                display.interpolation(),
            ) {
                Ok(resliced) => resliced,
                Err(err) => {
                    warn!(volume = %volume.id(), %err, "layer has no output");
                    return None;
                }
            };
            if outline {
                resliced = label_outline(&resliced, display.outline_thickness().unwrap_or(1));
            }
            let (image, stencil) = display.map_to_rgba(&resliced);
            Some(Rc::new(LayerOutput {
                image,
                stencil,
                mtime: TimeStamp::now(),
            }))
        });

        let mut state = self.state.borrow_mut();
        let path = &mut state.paths[index];
        path.output = output.clone();
        path.computed_at = TimeStamp::now();
        output
    }
}
