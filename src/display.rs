//! Display identity, kind and session modes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an attached display
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DisplayId(pub u32);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether frames go to a panel or into a host-supplied buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayKind {
    /// Panel or external monitor scanned out by the display hardware
    Physical,
    /// Output written into a buffer supplied per frame (screen recording, casting)
    Virtual,
}

/// Pixel layout of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba8888,
    Rgbx8888,
    Bgra8888,
    Rgb565,
    Rgba1010102,
    Yuv420,
}

impl PixelFormat {
    /// Bytes per pixel of the luma/packed plane
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Rgba8888
            | PixelFormat::Rgbx8888
            | PixelFormat::Bgra8888
            | PixelFormat::Rgba1010102 => 4,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Yuv420 => 1,
        }
    }
}

/// Static description of a display handed over on hotplug
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayInfo {
    /// Display id
    pub id: DisplayId,
    /// Physical or virtual
    pub kind: DisplayKind,
    /// Human-readable name used in logs
    pub name: String,
    /// Hardware input count; queried from the resource manager when `None`
    pub max_inputs: Option<usize>,
    /// Output format the display expects (mirror coupling remaps to it)
    pub output_format: PixelFormat,
}

impl DisplayInfo {
    /// Convenience constructor for a physical panel
    pub fn physical(id: u32, max_inputs: usize) -> Self {
        Self {
            id: DisplayId(id),
            kind: DisplayKind::Physical,
            name: format!("panel-{}", id),
            max_inputs: Some(max_inputs),
            output_format: PixelFormat::Rgba8888,
        }
    }

    /// Convenience constructor for a virtual display
    pub fn virtual_display(id: u32, max_inputs: usize) -> Self {
        Self {
            id: DisplayId(id),
            kind: DisplayKind::Virtual,
            name: format!("virtual-{}", id),
            max_inputs: Some(max_inputs),
            output_format: PixelFormat::Rgba8888,
        }
    }
}

/// How a display's frames are produced relative to other displays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Frames are composed straight into the panel
    #[default]
    DirectLink,
    /// Frames are composed into an intermediate buffer first
    Decouple,
    /// The display shows the composed output of another display
    MirrorDecouple { source: DisplayId },
}

impl SessionMode {
    /// Mirror source, if this mode mirrors another display
    pub fn mirror_source(&self) -> Option<DisplayId> {
        match self {
            SessionMode::MirrorDecouple { source } => Some(*source),
            _ => None,
        }
    }

    /// Whether switching between `self` and `other` changes a mirror relation
    pub fn crosses_mirror_boundary(&self, other: &SessionMode) -> bool {
        self.mirror_source() != other.mirror_source()
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::DirectLink => write!(f, "direct-link"),
            SessionMode::Decouple => write!(f, "decouple"),
            SessionMode::MirrorDecouple { source } => write!(f, "mirror-decouple(source={})", source),
        }
    }
}
