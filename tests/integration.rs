use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use glam::{DMat3, DMat4, DVec3};
use ndarray::Array3;

use volume_reslice::composite_node::CompositeInteraction;
use volume_reslice::compositor::CompositorEvent;
use volume_reslice::display::LookupTable;
use volume_reslice::observer::Priority;
use volume_reslice::reslice::{ResampleChannel, reslice};
use volume_reslice::slice_node::SliceInteraction;
use volume_reslice::{
    BatchKind, BlendMode, CompositorRegistry, Config, ImageData, Interpolation, LayerKind, Orientation,
    ParentTransform, Resolution, Scene, SliceActions, SliceCompositor, SliceLinkBroadcaster, Volume,
    VolumeKind, WarpField, XyToIjk,
};

const VIEWS: [(&str, Orientation); 3] = [
    ("Red", Orientation::Axial),
    ("Yellow", Orientation::Sagittal),
    ("Green", Orientation::Coronal),
];

fn gradient_volume(id: &str) -> Volume {
    let voxels = Array3::from_shape_fn((16, 16, 16), |(k, j, i)| (i + 2 * j + 3 * k) as i16);
    Volume::new(id, VolumeKind::Scalar)
        .with_image(ImageData::new(voxels).unwrap())
        .with_geometry(DVec3::splat(-7.5), DVec3::ONE, DMat3::IDENTITY)
}

fn label_volume(id: &str, value: u8) -> Volume {
    let voxels = Array3::from_elem((16, 16, 16), value);
    Volume::new(id, VolumeKind::Label)
        .with_image(ImageData::new(voxels).unwrap())
        .with_geometry(DVec3::splat(-7.5), DVec3::ONE, DMat3::IDENTITY)
}

/// Three linked views over one volume, wired the way an application would.
struct Viewer {
    scene: Rc<Scene>,
    compositors: Vec<Rc<SliceCompositor>>,
    broadcaster: Rc<SliceLinkBroadcaster>,
}

impl Viewer {
    fn new() -> Self {
        let scene = Scene::new(Config::default());
        scene.add_volume(gradient_volume("ct"));
        scene.add_volume(label_volume("seg", 1));

        let broadcaster = SliceLinkBroadcaster::new(&scene);
        let registry = CompositorRegistry::new();
        let compositors: Vec<_> = VIEWS
            .iter()
            .map(|(name, orientation)| {
                let compositor = SliceCompositor::new(&scene, name);
                registry.register(&compositor);
                compositor.slice_node().modify(|s| {
                    s.set_orientation(*orientation);
                    s.set_dimensions([32, 32, 1]);
                });
                compositor.composite_node().modify(|c| {
                    c.background_volume_id = Some("ct".into());
                    c.linked_control = true;
                    c.hot_linked_control = true;
                });
                compositor
            })
            .collect();
        let actions: Rc<dyn SliceActions> = registry;
        broadcaster.set_actions(Some(actions));
        Self {
            scene,
            compositors,
            broadcaster,
        }
    }

    fn view(&self, name: &str) -> &Rc<SliceCompositor> {
        self.compositors
            .iter()
            .find(|c| c.layout_name() == name)
            .unwrap()
    }
}

#[test]
fn test_field_of_view_propagates_with_peer_aspect() {
    let viewer = Viewer::new();
    let yellow = viewer.view("Yellow");
    yellow
        .slice_node()
        .modify(|s| s.set_field_of_view(DVec3::new(100.0, 200.0, 1.0)));

    let red = viewer.view("Red");
    red.start_slice_node_interaction(SliceInteraction::FIELD_OF_VIEW);
    red.slice_node()
        .modify(|s| s.set_field_of_view(DVec3::new(50.0, 80.0, 1.0)));
    red.end_slice_node_interaction();

    assert_eq!(
        yellow.slice_node().state().field_of_view(),
        DVec3::new(50.0, 100.0, 1.0)
    );
}

#[test]
fn test_orientation_mismatch_blocks_only_position() {
    let viewer = Viewer::new();
    let red = viewer.view("Red");
    let green = viewer.view("Green");
    let green_center = green.slice_node().state().center();

    red.start_slice_node_interaction(SliceInteraction::SLICE_TO_RAS | SliceInteraction::FIELD_OF_VIEW);
    red.slice_node().modify(|s| {
        s.slice_to_ras.w_axis.z = 3.0;
        s.set_field_of_view(DVec3::new(40.0, 40.0, 1.0));
    });
    red.end_slice_node_interaction();

    assert_eq!(green.slice_node().state().center(), green_center);
    assert_eq!(green.slice_node().state().field_of_view().x, 40.0);
}

#[test]
fn test_view_groups_do_not_cross() {
    let viewer = Viewer::new();
    let yellow = viewer.view("Yellow");
    yellow.slice_node().modify(|s| s.view_group = 2);
    yellow.composite_node().modify(|c| c.view_group = 2);

    let red = viewer.view("Red");
    red.start_slice_node_interaction(SliceInteraction::SLICE_VISIBLE);
    red.slice_node().modify(|s| s.slice_visible = true);
    red.end_slice_node_interaction();

    assert!(viewer.view("Green").slice_node().state().slice_visible);
    assert!(!yellow.slice_node().state().slice_visible);
}

#[test]
fn test_one_edit_modifies_each_peer_once() {
    let viewer = Viewer::new();
    let counts: Vec<Rc<Cell<u32>>> = (0..3).map(|_| Rc::new(Cell::new(0))).collect();
    let _subs: Vec<_> = viewer
        .compositors
        .iter()
        .zip(&counts)
        .map(|(compositor, count)| {
            let count = Rc::clone(count);
            compositor
                .slice_node()
                .events()
                .subscribe(Priority::Normal, move |_| count.set(count.get() + 1))
        })
        .collect();

    let red = viewer.view("Red");
    red.start_slice_node_interaction(SliceInteraction::LABEL_OUTLINE);
    red.slice_node().modify(|s| s.use_label_outline = true);

    assert_eq!(counts[0].get(), 1);
    assert_eq!(counts[1].get(), 1);
    assert_eq!(counts[2].get(), 1);
    assert!(!viewer.broadcaster.is_broadcasting());
    red.end_slice_node_interaction();
}

#[test]
fn test_reset_field_of_view_fits_peers() {
    let viewer = Viewer::new();
    let red = viewer.view("Red");
    red.start_slice_node_interaction(SliceInteraction::RESET_FIELD_OF_VIEW);
    red.slice_node().touch();
    red.end_slice_node_interaction();

    for name in ["Yellow", "Green"] {
        let fov = viewer.view(name).slice_node().state().field_of_view();
        assert!((fov.x - 16.0).abs() < 1e-9, "{name}: {fov}");
        assert!((fov.y - 16.0).abs() < 1e-9, "{name}: {fov}");
    }
}

#[test]
fn test_reformat_follows_normal() {
    let viewer = Viewer::new();
    let red = viewer.view("Red");
    let yellow = viewer.view("Yellow");
    let before = yellow.slice_node().state().normal();
    let tilt = DMat3::from_rotation_y(0.3);

    red.start_slice_node_interaction(SliceInteraction::MULTIPLANAR_REFORMAT);
    red.slice_node().modify(|s| s.set_rotation(tilt * s.rotation()));
    red.end_slice_node_interaction();

    let after = yellow.slice_node().state().normal();
    assert!(after.abs_diff_eq(tilt * before, 1e-9));
    assert_eq!(yellow.slice_node().state().orientation(), Orientation::Reformat);
}

#[test]
fn test_import_suppresses_linking() {
    let viewer = Viewer::new();
    let red = viewer.view("Red");
    {
        let _import = viewer.scene.begin(BatchKind::Import);
        red.start_slice_node_interaction(SliceInteraction::SLICE_VISIBLE);
        red.slice_node().modify(|s| s.slice_visible = true);
        red.end_slice_node_interaction();
    }
    assert!(!viewer.view("Green").slice_node().state().slice_visible);
}

#[test]
fn test_composite_linking() {
    let viewer = Viewer::new();
    let red = viewer.view("Red");
    red.start_composite_interaction(CompositeInteraction::LABEL_VOLUME);
    red.composite_node()
        .modify(|c| c.label_volume_id = Some("seg".into()));
    red.end_composite_interaction();

    for compositor in &viewer.compositors {
        assert_eq!(
            compositor.composite_node().state().label_volume_id.as_deref(),
            Some("seg")
        );
        assert!(compositor.layer(LayerKind::Label).volume().is_some());
    }
}

#[test]
fn test_opaque_label_is_topmost() {
    let viewer = Viewer::new();
    let red = viewer.view("Red");
    red.set_layers(
        viewer.scene.volume("ct").as_ref(),
        None,
        viewer.scene.volume("seg").as_ref(),
    );
    red.fit_slice_to_all(32, 32);
    let image = red.composited_image(Resolution::Xy).unwrap();
    assert_eq!(image.get_pixel(16, 16).0, LookupTable::labels().color(1));
}

#[test]
fn test_add_without_foreground_matches_alpha() {
    let viewer = Viewer::new();
    let red = viewer.view("Red");
    red.fit_slice_to_all(32, 32);
    let alpha = red.composited_image(Resolution::Xy).unwrap();

    let downgrades = Rc::new(Cell::new(0));
    let count = Rc::clone(&downgrades);
    let _sub = red.events().subscribe(Priority::Normal, move |event| {
        if let CompositorEvent::BlendModeDowngraded { .. } = event {
            count.set(count.get() + 1);
        }
    });
    red.composite_node().modify(|c| c.compositing = BlendMode::Add);

    assert_eq!(red.effective_blend_mode(), BlendMode::Alpha);
    assert_eq!(downgrades.get(), 1);
    assert_eq!(*red.composited_image(Resolution::Xy).unwrap(), *alpha);
}

#[test]
fn test_unchanged_inputs_keep_revision() {
    let viewer = Viewer::new();
    let red = viewer.view("Red");
    red.fit_slice_to_all(32, 32);
    let stamp = red.mtime();
    let image = red.composited_image(Resolution::Xy).unwrap();

    red.slice_node().modify(|_| ());
    red.update_pipeline();
    assert_eq!(red.mtime(), stamp);
    assert!(Rc::ptr_eq(&image, &red.composited_image(Resolution::Xy).unwrap()));
}

#[test]
fn test_removed_volume_stops_drawing() {
    let viewer = Viewer::new();
    let red = viewer.view("Red");
    assert!(red.composited_image(Resolution::Xy).is_some());
    viewer.scene.remove_volume("ct");
    assert!(red.layer(LayerKind::Background).volume().is_none());
    assert!(red.composited_image(Resolution::Xy).is_none());
}

#[test]
fn test_axial_reslice_matches_voxels() {
    let volume = gradient_volume("ct");
    let scene = Scene::new(Config::default());
    let node = scene.add_slice_node("Red");
    node.modify(|s| {
        s.set_dimensions([16, 16, 1]);
        s.set_field_of_view(DVec3::new(16.0, 16.0, 1.0));
        // Pixel (x, y) lands on voxel (15 - x, y, 4).
        s.slice_to_ras.w_axis = DVec3::new(-0.5, 0.5, -3.5).extend(1.0);
    });
    let state = node.snapshot();

    let transform = XyToIjk::compose(
        state.xy_to_ras(),
        None,
        volume.ras_to_ijk().unwrap(),
        Config::default().permutation_suppression,
    )
    .unwrap();
    assert!(transform.is_permutation());

    let image = volume.image().unwrap();
    let resliced = reslice(image, ResampleChannel::Scalars, &transform, [16, 16, 1], Interpolation::Nearest).unwrap();
    let expected = volume.axis_slice(4, Orientation::Axial).unwrap();
    for y in 0..16 {
        for x in 0..16 {
            let ijk = transform.map(DVec3::new(x as f64, y as f64, 0.0)).round();
            assert_eq!(ijk.z, 4.0);
            let (i, j) = (ijk.x as usize, ijk.y as usize);
            assert!(resliced.inside[[0, y, x]]);
            assert_eq!(resliced.values[[0, y, x, 0]], expected[[j, i]]);
        }
    }
}

#[derive(Debug)]
struct Shift(DVec3);

impl WarpField for Shift {
    fn world_to_local(&self, world: DVec3) -> DVec3 {
        world - self.0
    }
}

#[test]
fn test_warped_volume_uses_general_transform() {
    let scene = Scene::new(Config::default());
    scene.add_volume(
        gradient_volume("ct").with_parent_transform(ParentTransform::Warp(Arc::new(Shift(DVec3::X)))),
    );
    let compositor = SliceCompositor::new(&scene, "Red");
    compositor
        .composite_node()
        .modify(|c| c.background_volume_id = Some("ct".into()));
    let layer = compositor.layer(LayerKind::Background);
    assert!(matches!(layer.xy_to_ijk(Resolution::Xy), XyToIjk::General { .. }));
    assert!(layer.output(Resolution::Xy).is_some());

    let linear = ParentTransform::Linear {
        to_world: DMat4::from_translation(DVec3::X),
    };
    scene.volume("ct").unwrap().set_parent_transform(Some(linear));
    assert!(layer.xy_to_ijk(Resolution::Xy).linear_matrix().is_some());
}
