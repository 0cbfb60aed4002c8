/// Named slice orientations. `Reformat` marks any oblique plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Orientation {
    #[default]
    Axial,
    Coronal,
    Sagittal,
    Reformat,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Axial => "Axial",
            Orientation::Coronal => "Coronal",
            Orientation::Sagittal => "Sagittal",
            Orientation::Reformat => "Reformat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
}

/// Voxel scalar types a volume can store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F16,
    F32,
    F64,
    I64,
    U64,
}

impl ScalarType {
    /// Whether every value of this type survives a round trip through `f64`.
    pub fn is_exact_in_f64(&self) -> bool {
        !matches!(self, ScalarType::I64 | ScalarType::U64)
    }
}

/// Volume subtypes, each with its own display-properties flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VolumeKind {
    #[default]
    Scalar,
    Label,
    Vector,
    DiffusionWeighted,
    DiffusionTensor,
}

/// How the layers of a slice view are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Alpha,
    ReverseAlpha,
    Add,
    Subtract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionMode {
    /// Texture follows the on-screen pixel grid
    #[default]
    Match2DView,
    /// Texture covers all volumes at their lowest spacing
    MatchVolumes,
    FovMatch2DViewSpacingMatchVolumes,
    FovMatchVolumesSpacingMatch2DView,
    /// UVW parameters are left untouched
    Custom,
}

/// Selects one of the two resample variants every layer maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Matches the 2D view pixel grid
    Xy,
    /// Fixed 3D texture grid
    Uvw,
}

impl Resolution {
    pub const ALL: [Resolution; 2] = [Resolution::Xy, Resolution::Uvw];

    pub(crate) fn index(self) -> usize {
        match self {
            Resolution::Xy => 0,
            Resolution::Uvw => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Background,
    Foreground,
    Label,
}

impl LayerKind {
    pub const ALL: [LayerKind; 3] = [LayerKind::Background, LayerKind::Foreground, LayerKind::Label];

    pub(crate) fn index(self) -> usize {
        match self {
            LayerKind::Background => 0,
            LayerKind::Foreground => 1,
            LayerKind::Label => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SliceSpacingMode {
    #[default]
    Automatic,
    Prescribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JumpMode {
    #[default]
    Offset,
    Centered,
}

/// Scalar reduction applied to resliced diffusion tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorScalarMode {
    Trace,
    MeanDiffusivity,
    #[default]
    FractionalAnisotropy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    Perspective,
    Orthographic,
}
