use serde::Deserialize;

mod bitstream;

pub use bitstream::Bitstream;

// Pixel layouts the pipeline knows how to size. The layout itself is opaque to the
// driver; only the device interprets it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FourCc {
    // 8-bit 4:2:0, Y plane + interleaved UV
    Nv12,
    // 10-bit 4:2:0 stored in 16-bit words
    P010,
    // packed 8-bit BGRA
    Rgb4,
}

impl FourCc {
    // Bytes for a frame of the given dimension
    pub const fn frame_size(&self, dim: Dim) -> usize {
        let area = dim.width as usize * dim.height as usize;
        match self {
            FourCc::Nv12 => area * 3 / 2,
            FourCc::P010 => area * 3,
            FourCc::Rgb4 => area * 4,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
pub struct Dim {
    pub width: u32,
    pub height: u32,
}

impl Dim {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

// Format descriptor of a surface; fixed when its pool is created
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
pub struct FrameInfo {
    pub fourcc: FourCc,
    #[serde(flatten)]
    pub dim: Dim,
}

impl FrameInfo {
    pub const fn new(fourcc: FourCc, width: u32, height: u32) -> Self {
        Self {
            fourcc,
            dim: Dim::new(width, height),
        }
    }

    pub const fn frame_size(&self) -> usize {
        self.fourcc.frame_size(self.dim)
    }
}

pub enum OutHandle {
    Stdout,
    File(String),
    // output disabled; encoded frames are synced and dropped
    Null,
}

impl OutHandle {
    pub fn from_str(uri: String) -> Self {
        if uri == "-" {
            OutHandle::Stdout
        } else {
            OutHandle::File(uri)
        }
    }
}

pub enum InHandle {
    File(String),
    Stdin,
}

impl InHandle {
    pub fn from_str(uri: String) -> Self {
        if uri == "-" {
            InHandle::Stdin
        } else {
            InHandle::File(uri)
        }
    }
}
