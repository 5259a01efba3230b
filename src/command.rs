/*!
Command records.

A [`Command`] is one entry of a command buffer's log. Kernel dispatches are
stored in a side table of the command buffer and referenced by index, so the
log itself stays cheap to clone.
*/

use crate::{
    error::Error,
    memory::{DeviceBuffer, HostBuffer, Image},
    query::QueryPool,
};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/// Largest fill pattern, in bytes.
pub const MAX_FILL_PATTERN_SIZE: usize = 128;

/// A fill pattern copied inline into the record.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FillPattern {
    bytes: [u8; MAX_FILL_PATTERN_SIZE],
    len: usize,
}

impl FillPattern {
    /// `pattern` must be a power of two of at most [`MAX_FILL_PATTERN_SIZE`] bytes.
    pub fn new(pattern: &[u8]) -> Result<Self, Error> {
        let len = pattern.len();
        if len == 0 || len > MAX_FILL_PATTERN_SIZE || !len.is_power_of_two() {
            return Err(Error::InvalidValue);
        }
        let mut bytes = [0; MAX_FILL_PATTERN_SIZE];
        bytes[..len].copy_from_slice(pattern);
        Ok(Self { bytes, len })
    }
    /// An image fill color, any size up to a pixel.
    pub(crate) fn color(color: &[u8]) -> Result<Self, Error> {
        let len = color.len();
        if len == 0 || len > 16 {
            return Err(Error::InvalidValue);
        }
        let mut bytes = [0; MAX_FILL_PATTERN_SIZE];
        bytes[..len].copy_from_slice(color);
        Ok(Self { bytes, len })
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Debug for FillPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("FillPattern").field(&self.as_slice()).finish()
    }
}

/** A 3D box copied between two linear memories.

Pitches are `[row, slice]` in bytes, a zero pitch means tightly packed. The
x component of origins and extents is in bytes. */
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferRegion {
    pub src_origin: [usize; 3],
    pub dst_origin: [usize; 3],
    pub extent: [usize; 3],
    pub src_pitch: [usize; 2],
    pub dst_pitch: [usize; 2],
}

/// One contiguous row of a [`BufferRegion`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Row {
    pub src_offset: usize,
    pub dst_offset: usize,
    pub size: usize,
}

fn normalize_pitch(pitch: [usize; 2], extent: [usize; 3]) -> Result<[usize; 2], Error> {
    let row = if pitch[0] == 0 { extent[0] } else { pitch[0] };
    let min_slice = row.checked_mul(extent[1]).ok_or(Error::InvalidValue)?;
    let slice = if pitch[1] == 0 { min_slice } else { pitch[1] };
    if row < extent[0] || slice < min_slice {
        return Err(Error::InvalidValue);
    }
    Ok([row, slice])
}

fn offset_of(origin: [usize; 3], pitch: [usize; 2], y: usize, z: usize) -> Option<usize> {
    let slice = origin[2].checked_add(z)?.checked_mul(pitch[1])?;
    let row = origin[1].checked_add(y)?.checked_mul(pitch[0])?;
    slice.checked_add(row)?.checked_add(origin[0])
}

impl BufferRegion {
    /** Splits the box into one row per y and z, in z-major order.

    Rows are not merged even when they are contiguous.

    **errors**
    - [`Error::InvalidValue`] if an extent is zero, a pitch is too small for
      the extent, or an offset overflows. */
    pub fn rows(&self) -> Result<Vec<Row>, Error> {
        if self.extent.contains(&0) {
            return Err(Error::InvalidValue);
        }
        let src_pitch = normalize_pitch(self.src_pitch, self.extent)?;
        let dst_pitch = normalize_pitch(self.dst_pitch, self.extent)?;
        let count = self.extent[1]
            .checked_mul(self.extent[2])
            .ok_or(Error::InvalidValue)?;
        let mut rows = Vec::new();
        rows.try_reserve_exact(count)?;
        for z in 0..self.extent[2] {
            for y in 0..self.extent[1] {
                let src_offset =
                    offset_of(self.src_origin, src_pitch, y, z).ok_or(Error::InvalidValue)?;
                let dst_offset =
                    offset_of(self.dst_origin, dst_pitch, y, z).ok_or(Error::InvalidValue)?;
                rows.push(Row {
                    src_offset,
                    dst_offset,
                    size: self.extent[0],
                });
            }
        }
        Ok(rows)
    }
}

/// Called by the device when the command executes.
pub type UserCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::IsVariant)]
pub enum CommandKind {
    ReadBuffer,
    WriteBuffer,
    CopyBuffer,
    FillBuffer,
    ReadImage,
    WriteImage,
    FillImage,
    CopyImage,
    CopyImageToBuffer,
    CopyBufferToImage,
    NdRange,
    UserCallback,
    BeginQuery,
    EndQuery,
    ResetQueryPool,
}

/// Host side of an image transfer; pitches of zero mean tightly packed.
#[derive(Clone, Debug)]
pub struct HostImageRegion {
    pub host: HostBuffer,
    pub offset: usize,
    pub row_pitch: usize,
    pub slice_pitch: usize,
}

/// One recorded command.
#[derive(Clone)]
pub enum Command {
    ReadBuffer {
        buffer: DeviceBuffer,
        offset: usize,
        host: HostBuffer,
        host_offset: usize,
        size: usize,
    },
    WriteBuffer {
        buffer: DeviceBuffer,
        offset: usize,
        host: HostBuffer,
        host_offset: usize,
        size: usize,
    },
    CopyBuffer {
        src: DeviceBuffer,
        src_offset: usize,
        dst: DeviceBuffer,
        dst_offset: usize,
        size: usize,
    },
    FillBuffer {
        buffer: DeviceBuffer,
        offset: usize,
        size: usize,
        pattern: FillPattern,
    },
    ReadImage {
        image: Image,
        origin: [usize; 3],
        extent: [usize; 3],
        host: HostImageRegion,
    },
    WriteImage {
        image: Image,
        origin: [usize; 3],
        extent: [usize; 3],
        host: HostImageRegion,
    },
    FillImage {
        image: Image,
        color: FillPattern,
        origin: [usize; 3],
        extent: [usize; 3],
    },
    CopyImage {
        src: Image,
        dst: Image,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        extent: [usize; 3],
    },
    CopyImageToBuffer {
        src: Image,
        dst: DeviceBuffer,
        src_origin: [usize; 3],
        dst_offset: usize,
        extent: [usize; 3],
    },
    CopyBufferToImage {
        src: DeviceBuffer,
        dst: Image,
        src_offset: usize,
        dst_origin: [usize; 3],
        extent: [usize; 3],
    },
    /// Index into the command buffer's dispatch table.
    NdRange(usize),
    UserCallback(UserCallback),
    BeginQuery {
        pool: QueryPool,
        index: usize,
        count: usize,
    },
    EndQuery {
        pool: QueryPool,
        index: usize,
        count: usize,
    },
    ResetQueryPool {
        pool: QueryPool,
        index: usize,
        count: usize,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::ReadBuffer { .. } => CommandKind::ReadBuffer,
            Self::WriteBuffer { .. } => CommandKind::WriteBuffer,
            Self::CopyBuffer { .. } => CommandKind::CopyBuffer,
            Self::FillBuffer { .. } => CommandKind::FillBuffer,
            Self::ReadImage { .. } => CommandKind::ReadImage,
            Self::WriteImage { .. } => CommandKind::WriteImage,
            Self::FillImage { .. } => CommandKind::FillImage,
            Self::CopyImage { .. } => CommandKind::CopyImage,
            Self::CopyImageToBuffer { .. } => CommandKind::CopyImageToBuffer,
            Self::CopyBufferToImage { .. } => CommandKind::CopyBufferToImage,
            Self::NdRange(_) => CommandKind::NdRange,
            Self::UserCallback(_) => CommandKind::UserCallback,
            Self::BeginQuery { .. } => CommandKind::BeginQuery,
            Self::EndQuery { .. } => CommandKind::EndQuery,
            Self::ResetQueryPool { .. } => CommandKind::ResetQueryPool,
        }
    }
}

impl Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ReadBuffer { offset, size, .. } | Self::WriteBuffer { offset, size, .. } => f
                .debug_struct(&format!("{:?}", self.kind()))
                .field("offset", offset)
                .field("size", size)
                .finish(),
            Self::CopyBuffer {
                src_offset,
                dst_offset,
                size,
                ..
            } => f
                .debug_struct("CopyBuffer")
                .field("src_offset", src_offset)
                .field("dst_offset", dst_offset)
                .field("size", size)
                .finish(),
            Self::FillBuffer {
                offset,
                size,
                pattern,
                ..
            } => f
                .debug_struct("FillBuffer")
                .field("offset", offset)
                .field("size", size)
                .field("pattern", pattern)
                .finish(),
            Self::NdRange(index) => f.debug_tuple("NdRange").field(index).finish(),
            Self::BeginQuery { index, count, .. }
            | Self::EndQuery { index, count, .. }
            | Self::ResetQueryPool { index, count, .. } => f
                .debug_struct(&format!("{:?}", self.kind()))
                .field("index", index)
                .field("count", count)
                .finish(),
            _ => write!(f, "{:?}", self.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_pattern_sizes() {
        for len in [1, 2, 4, 8, 16, 32, 64, 128] {
            let pattern = FillPattern::new(&vec![0xab; len]).unwrap();
            assert_eq!(pattern.as_slice().len(), len);
        }
        for len in [0, 3, 12, 256] {
            assert_eq!(
                FillPattern::new(&vec![0; len]).err(),
                Some(Error::InvalidValue)
            );
        }
    }

    #[test]
    fn region_2d_rows() -> Result<(), Error> {
        let (w, h) = (5, 3);
        let region = BufferRegion {
            src_origin: [2, 0, 0],
            dst_origin: [1, 0, 0],
            extent: [w, h, 1],
            src_pitch: [16, 0],
            dst_pitch: [8, 0],
        };
        let rows = region.rows()?;
        assert_eq!(rows.len(), h);
        for (row, r) in rows.iter().zip(0..) {
            assert_eq!(row.size, w);
            assert_eq!(row.src_offset, 2 + r * 16);
            assert_eq!(row.dst_offset, 1 + r * 8);
        }
        Ok(())
    }

    #[test]
    fn region_3d_rows() -> Result<(), Error> {
        let region = BufferRegion {
            src_origin: [1, 1, 1],
            dst_origin: [0, 0, 0],
            extent: [2, 2, 2],
            src_pitch: [4, 16],
            dst_pitch: [0, 0],
        };
        let rows = region.rows()?;
        let src: Vec<_> = rows.iter().map(|r| r.src_offset).collect();
        let dst: Vec<_> = rows.iter().map(|r| r.dst_offset).collect();
        assert_eq!(src, [16 + 4 + 1, 16 + 8 + 1, 32 + 4 + 1, 32 + 8 + 1]);
        assert_eq!(dst, [0, 2, 4, 6]);
        Ok(())
    }

    #[test]
    fn region_invalid_pitch() {
        let region = BufferRegion {
            extent: [8, 2, 1],
            src_pitch: [4, 0],
            ..BufferRegion::default()
        };
        assert_eq!(region.rows().err(), Some(Error::InvalidValue));
        let region = BufferRegion {
            extent: [8, 0, 1],
            ..BufferRegion::default()
        };
        assert_eq!(region.rows().err(), Some(Error::InvalidValue));
    }
}
