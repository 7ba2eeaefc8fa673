use std::collections::BTreeSet;

use image::Rgba;

use crate::postprocess::LabelGrid;

/// Pascal VOC category names; id 0 is "no detection".
pub const VOC_CLASSES: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

pub const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

const fn opaque(r: u8, g: u8, b: u8) -> Rgba<u8> {
    Rgba([r, g, b, 255])
}

/// One color per VOC class, background first.
const STANDARD_COLORS: [Rgba<u8>; 21] = [
    TRANSPARENT,
    opaque(255, 0, 0),
    opaque(0, 255, 0),
    opaque(0, 0, 255),
    opaque(0, 255, 255),
    opaque(255, 0, 255),
    opaque(255, 255, 0),
    opaque(255, 200, 0),
    opaque(255, 175, 175),
    opaque(128, 0, 0),
    opaque(0, 128, 0),
    opaque(0, 0, 128),
    opaque(128, 128, 0),
    opaque(128, 0, 128),
    opaque(0, 128, 128),
    opaque(192, 192, 192),
    opaque(128, 128, 128),
    opaque(153, 51, 0),
    opaque(51, 153, 0),
    opaque(51, 0, 153),
    opaque(0, 153, 153),
];

/// Ordered, immutable list of class names indexed by class id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCatalog {
    names: Box<[String]>,
}

impl ClassCatalog {
    /// Builds a catalog from names; the first entry is the background class.
    ///
    /// Returns `None` for an empty list.
    pub fn new<I, S>(names: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Box<[String]> = names.into_iter().map(Into::into).collect();
        (!names.is_empty()).then_some(Self { names })
    }

    pub fn voc() -> Self {
        Self {
            names: VOC_CLASSES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, class_id: u32) -> Option<&str> {
        self.names.get(class_id as usize).map(String::as_str)
    }

    /// Names of the non-background classes present in `grid`, in id order.
    pub fn detected(&self, grid: &LabelGrid) -> Vec<&str> {
        grid.as_array()
            .iter()
            .copied()
            .filter(|&id| id > 0)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|id| self.name(id))
            .collect()
    }
}

impl Default for ClassCatalog {
    fn default() -> Self {
        Self::voc()
    }
}

/// Class id to color lookup used for visualization only.
///
/// Entry 0 is the background color and is also used for any id the palette
/// does not cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Box<[Rgba<u8>]>,
}

impl Palette {
    /// Returns `None` when `colors` is empty.
    pub fn new(colors: Vec<Rgba<u8>>) -> Option<Self> {
        (!colors.is_empty()).then(|| Self {
            colors: colors.into_boxed_slice(),
        })
    }

    /// Saturated primaries followed by darker secondaries, background transparent.
    pub fn standard() -> Self {
        Self {
            colors: STANDARD_COLORS.into(),
        }
    }

    /// High-visibility ramp from cyan-blue to magenta-blue.
    pub fn neon(len: usize) -> Self {
        let colors = (0..len.max(1))
            .map(|id| {
                if id == 0 {
                    return TRANSPARENT;
                }
                let step = (id * 20).min(255) as u8;
                opaque(step, 255 - step, 255)
            })
            .collect();
        Self { colors }
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn background(&self) -> Rgba<u8> {
        self.colors[0]
    }

    /// Color for `class_id`, falling back to the background color.
    pub fn color(&self, class_id: u32) -> Rgba<u8> {
        self.colors
            .get(class_id as usize)
            .copied()
            .unwrap_or_else(|| self.background())
    }

    /// Whether every id of `catalog` has its own color.
    pub fn covers(&self, catalog: &ClassCatalog) -> bool {
        self.len() >= catalog.len()
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::standard()
    }
}
