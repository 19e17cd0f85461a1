// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! formats: Utility file for dealing with HAL and DRM formats, and the geometry every backend
//! allocates with.

use std::fmt;

use vmm_sys_util::align_upwards;

use crate::gralloc_utils::*;

/*
 * HAL pixel formats from Android's system/graphics.h.  0x100 - 0x1FF is reserved for
 * implementation specific formats, DRM_NV12 lives there.
 */
pub const HAL_PIXEL_FORMAT_RGBA_8888: u32 = 1;
pub const HAL_PIXEL_FORMAT_RGBX_8888: u32 = 2;
pub const HAL_PIXEL_FORMAT_RGB_888: u32 = 3;
pub const HAL_PIXEL_FORMAT_RGB_565: u32 = 4;
pub const HAL_PIXEL_FORMAT_BGRA_8888: u32 = 5;
pub const HAL_PIXEL_FORMAT_YCBCR_422_SP: u32 = 0x10;
pub const HAL_PIXEL_FORMAT_YCRCB_420_SP: u32 = 0x11;
pub const HAL_PIXEL_FORMAT_YCBCR_422_I: u32 = 0x14;
pub const HAL_PIXEL_FORMAT_YV12: u32 = 0x3231_5659;
pub const HAL_PIXEL_FORMAT_DRM_NV12: u32 = 0x102;

pub const DRM_FORMAT_RGB565: [u8; 4] = [b'R', b'G', b'1', b'6'];
pub const DRM_FORMAT_BGR888: [u8; 4] = [b'B', b'G', b'2', b'4'];
pub const DRM_FORMAT_XRGB8888: [u8; 4] = [b'X', b'R', b'2', b'4'];
pub const DRM_FORMAT_XBGR8888: [u8; 4] = [b'X', b'B', b'2', b'4'];
pub const DRM_FORMAT_ARGB8888: [u8; 4] = [b'A', b'R', b'2', b'4'];
pub const DRM_FORMAT_ABGR8888: [u8; 4] = [b'A', b'B', b'2', b'4'];
pub const DRM_FORMAT_YUYV: [u8; 4] = [b'Y', b'U', b'Y', b'V'];
pub const DRM_FORMAT_NV12: [u8; 4] = [b'N', b'V', b'1', b'2'];
pub const DRM_FORMAT_NV16: [u8; 4] = [b'N', b'V', b'1', b'6'];
pub const DRM_FORMAT_NV21: [u8; 4] = [b'N', b'V', b'2', b'1'];
pub const DRM_FORMAT_YVU420: [u8; 4] = [b'Y', b'V', b'1', b'2'];

/// A [fourcc](https://en.wikipedia.org/wiki/FourCC) format identifier.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct DrmFormat(pub u32);

impl DrmFormat {
    /// Constructs a format identifer using a fourcc byte sequence.
    #[inline(always)]
    pub fn new(a: u8, b: u8, c: u8, d: u8) -> DrmFormat {
        DrmFormat(a as u32 | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24)
    }

    #[inline(always)]
    pub fn from_bytes(b: [u8; 4]) -> DrmFormat {
        DrmFormat::new(b[0], b[1], b[2], b[3])
    }

    /// Returns the fourcc code as a sequence of bytes.
    #[inline(always)]
    pub fn to_bytes(&self) -> [u8; 4] {
        let f = self.0;
        [f as u8, (f >> 8) as u8, (f >> 16) as u8, (f >> 24) as u8]
    }
}

impl From<u32> for DrmFormat {
    fn from(u: u32) -> DrmFormat {
        DrmFormat(u)
    }
}

impl From<DrmFormat> for u32 {
    fn from(f: DrmFormat) -> u32 {
        f.0
    }
}

impl fmt::Debug for DrmFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.to_bytes();
        if b.iter().all(u8::is_ascii_graphic) {
            write!(
                f,
                "fourcc({}{}{}{})",
                b[0] as char, b[1] as char, b[2] as char, b[3] as char
            )
        } else {
            write!(
                f,
                "fourcc(0x{:02x}{:02x}{:02x}{:02x})",
                b[0], b[1], b[2], b[3]
            )
        }
    }
}

/// Where the chroma samples of a YUV format live relative to the luma plane.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ChromaLayout {
    /// Packed RGB or packed YUV, a single plane.
    Packed,
    /// One interleaved CbCr plane after luma, `1 / vertical_subsampling` of its height.
    Interleaved { vertical_subsampling: u32 },
    /// Separate Cr and Cb planes after luma, each half pitch and half height.
    Separate,
}

/// Allocation properties of a HAL format.
#[derive(Copy, Clone, Debug)]
struct FormatInfo {
    bytes_per_pixel: u32,
    align_w: u32,
    align_h: u32,
    extra_height_div: u32,
    drm_format: [u8; 4],
    chroma: ChromaLayout,
}

static RGBA_8888: FormatInfo = FormatInfo {
    bytes_per_pixel: 4,
    align_w: 1,
    align_h: 1,
    extra_height_div: 0,
    drm_format: DRM_FORMAT_ABGR8888,
    chroma: ChromaLayout::Packed,
};

static RGBX_8888: FormatInfo = FormatInfo {
    drm_format: DRM_FORMAT_XBGR8888,
    ..RGBA_8888
};

static BGRA_8888: FormatInfo = FormatInfo {
    drm_format: DRM_FORMAT_ARGB8888,
    ..RGBA_8888
};

static RGB_888: FormatInfo = FormatInfo {
    bytes_per_pixel: 3,
    align_w: 1,
    align_h: 1,
    extra_height_div: 0,
    drm_format: DRM_FORMAT_BGR888,
    chroma: ChromaLayout::Packed,
};

static RGB_565: FormatInfo = FormatInfo {
    bytes_per_pixel: 2,
    align_w: 1,
    align_h: 1,
    extra_height_div: 0,
    drm_format: DRM_FORMAT_RGB565,
    chroma: ChromaLayout::Packed,
};

static YCBCR_422_I: FormatInfo = FormatInfo {
    bytes_per_pixel: 2,
    align_w: 2,
    align_h: 1,
    extra_height_div: 0,
    drm_format: DRM_FORMAT_YUYV,
    chroma: ChromaLayout::Packed,
};

static DRM_NV12: FormatInfo = FormatInfo {
    bytes_per_pixel: 1,
    align_w: 32,
    align_h: 2,
    extra_height_div: 2,
    drm_format: DRM_FORMAT_NV12,
    chroma: ChromaLayout::Interleaved {
        vertical_subsampling: 2,
    },
};

static YV12: FormatInfo = FormatInfo {
    drm_format: DRM_FORMAT_YVU420,
    chroma: ChromaLayout::Separate,
    ..DRM_NV12
};

static YCBCR_422_SP: FormatInfo = FormatInfo {
    bytes_per_pixel: 1,
    align_w: 2,
    align_h: 1,
    extra_height_div: 1,
    drm_format: DRM_FORMAT_NV16,
    chroma: ChromaLayout::Interleaved {
        vertical_subsampling: 1,
    },
};

static YCRCB_420_SP: FormatInfo = FormatInfo {
    bytes_per_pixel: 1,
    align_w: 2,
    align_h: 2,
    extra_height_div: 2,
    drm_format: DRM_FORMAT_NV21,
    chroma: ChromaLayout::Interleaved {
        vertical_subsampling: 2,
    },
};

fn format_info(format: u32) -> Option<&'static FormatInfo> {
    match format {
        HAL_PIXEL_FORMAT_RGBA_8888 => Some(&RGBA_8888),
        HAL_PIXEL_FORMAT_RGBX_8888 => Some(&RGBX_8888),
        HAL_PIXEL_FORMAT_BGRA_8888 => Some(&BGRA_8888),
        HAL_PIXEL_FORMAT_RGB_888 => Some(&RGB_888),
        HAL_PIXEL_FORMAT_RGB_565 => Some(&RGB_565),
        HAL_PIXEL_FORMAT_YCBCR_422_I => Some(&YCBCR_422_I),
        HAL_PIXEL_FORMAT_DRM_NV12 => Some(&DRM_NV12),
        HAL_PIXEL_FORMAT_YV12 => Some(&YV12),
        HAL_PIXEL_FORMAT_YCBCR_422_SP => Some(&YCBCR_422_SP),
        HAL_PIXEL_FORMAT_YCRCB_420_SP => Some(&YCRCB_420_SP),
        _ => None,
    }
}

/// Returns the bytes per pixel of `format`.  Planar formats only count the luma plane.  Zero
/// means the format is unsupported.
pub fn get_bpp(format: u32) -> u32 {
    format_info(format).map_or(0, |info| info.bytes_per_pixel)
}

/// Returns the `(width_alignment, height_alignment)` allocations of `format` obey.
pub fn geometry_alignment(format: u32) -> (u32, u32) {
    format_info(format).map_or((1, 1), |info| (info.align_w, info.align_h))
}

/// Aligns `width` and `height` for allocation.  Planar layouts get extra rows for the chroma
/// planes that follow the luma plane.
pub fn align_geometry(format: u32, width: u32, height: u32) -> GrallocResult<(u32, u32)> {
    let (align_w, align_h, extra_height_div) = match format_info(format) {
        Some(info) => (info.align_w, info.align_h, info.extra_height_div),
        None => (1, 1, 0),
    };

    let aligned_width = align_dimension(width, align_w)?;
    let mut aligned_height = align_dimension(height, align_h)?;

    if extra_height_div != 0 {
        let extra = aligned_height / extra_height_div;
        aligned_height = checked_arithmetic!(aligned_height + extra)?;
    }

    Ok((aligned_width, aligned_height))
}

fn align_dimension(value: u32, alignment: u32) -> GrallocResult<u32> {
    let max = u32::MAX - (alignment - 1);
    if value > max {
        return Err(GrallocError::CheckedRange {
            field1: ("value", value as usize),
            field2: ("max", max as usize),
        });
    }

    Ok(align_upwards!(value, alignment))
}

/// Returns the fourcc the display subsystem knows `format` by.
pub fn drm_format(format: u32) -> GrallocResult<DrmFormat> {
    format_info(format)
        .map(|info| DrmFormat::from_bytes(info.drm_format))
        .ok_or(GrallocError::UnsupportedFormat(format))
}

/// Sizes of a fresh allocation, shared by every backend.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BufferGeometry {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub stride: u32,
    pub size: u64,
}

impl BufferGeometry {
    /// Computes the aligned geometry of a `width` x `height` buffer of `format`.
    pub fn new(format: u32, width: u32, height: u32) -> GrallocResult<BufferGeometry> {
        let bytes_per_pixel = get_bpp(format);
        if bytes_per_pixel == 0 {
            return Err(GrallocError::UnsupportedFormat(format));
        }

        let (width, height) = align_geometry(format, width, height)?;
        let stride = checked_arithmetic!(width * bytes_per_pixel)?;
        let size = (stride as u64)
            .checked_mul(height as u64)
            .ok_or(GrallocError::CheckedArithmetic {
                field1: ("stride", stride as usize),
                field2: ("height", height as usize),
                op: "*",
            })?;

        Ok(BufferGeometry {
            width,
            height,
            bytes_per_pixel,
            stride,
            size,
        })
    }
}

/// Per-plane layout of a buffer as the display subsystem wants it for framebuffer creation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FramebufferLayout {
    pub drm_format: DrmFormat,
    pub num_planes: usize,
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
}

/// Resolves the planes of a `format` buffer with luma `stride` and requested `height`.
pub fn framebuffer_layout(
    format: u32,
    stride: u32,
    height: u32,
) -> GrallocResult<FramebufferLayout> {
    let info = format_info(format).ok_or(GrallocError::UnsupportedFormat(format))?;
    let luma_height = align_dimension(height, info.align_h)?;
    let luma_size = checked_arithmetic!(stride * luma_height)?;

    let mut layout = FramebufferLayout {
        drm_format: DrmFormat::from_bytes(info.drm_format),
        num_planes: 1,
        ..Default::default()
    };
    layout.pitches[0] = stride;

    match info.chroma {
        ChromaLayout::Packed => (),
        ChromaLayout::Interleaved { .. } => {
            layout.num_planes = 2;
            layout.pitches[1] = stride;
            layout.offsets[1] = luma_size;
        }
        ChromaLayout::Separate => {
            let chroma_pitch = stride / 2;
            let chroma_height = luma_height / 2;
            let chroma_size = checked_arithmetic!(chroma_pitch * chroma_height)?;
            layout.num_planes = 3;
            layout.pitches[1] = chroma_pitch;
            layout.pitches[2] = chroma_pitch;
            layout.offsets[1] = luma_size;
            layout.offsets[2] = checked_arithmetic!(luma_size + chroma_size)?;
        }
    }

    Ok(layout)
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use super::*;

    const ALL_FORMATS: [u32; 10] = [
        HAL_PIXEL_FORMAT_RGBA_8888,
        HAL_PIXEL_FORMAT_RGBX_8888,
        HAL_PIXEL_FORMAT_RGB_888,
        HAL_PIXEL_FORMAT_RGB_565,
        HAL_PIXEL_FORMAT_BGRA_8888,
        HAL_PIXEL_FORMAT_YCBCR_422_SP,
        HAL_PIXEL_FORMAT_YCRCB_420_SP,
        HAL_PIXEL_FORMAT_YCBCR_422_I,
        HAL_PIXEL_FORMAT_YV12,
        HAL_PIXEL_FORMAT_DRM_NV12,
    ];

    #[test]
    fn format_debug() {
        let f = DrmFormat::new(b'X', b'R', b'2', b'4');
        let mut buf = String::new();
        write!(&mut buf, "{:?}", f).unwrap();
        assert_eq!(buf, "fourcc(XR24)");

        let f = DrmFormat::new(0, 1, 2, 16);
        let mut buf = String::new();
        write!(&mut buf, "{:?}", f).unwrap();
        assert_eq!(buf, "fourcc(0x00010210)");
    }

    #[test]
    fn bytes_per_pixel() {
        assert_eq!(get_bpp(HAL_PIXEL_FORMAT_RGBA_8888), 4);
        assert_eq!(get_bpp(HAL_PIXEL_FORMAT_RGBX_8888), 4);
        assert_eq!(get_bpp(HAL_PIXEL_FORMAT_BGRA_8888), 4);
        assert_eq!(get_bpp(HAL_PIXEL_FORMAT_RGB_888), 3);
        assert_eq!(get_bpp(HAL_PIXEL_FORMAT_RGB_565), 2);
        assert_eq!(get_bpp(HAL_PIXEL_FORMAT_YCBCR_422_I), 2);
        assert_eq!(get_bpp(HAL_PIXEL_FORMAT_YV12), 1);
        assert_eq!(get_bpp(HAL_PIXEL_FORMAT_DRM_NV12), 1);
        assert_eq!(get_bpp(HAL_PIXEL_FORMAT_YCBCR_422_SP), 1);
        assert_eq!(get_bpp(HAL_PIXEL_FORMAT_YCRCB_420_SP), 1);

        assert_eq!(get_bpp(0), 0);
        assert_eq!(get_bpp(0x7f), 0);
        assert_eq!(get_bpp(0x101), 0);
    }

    #[test]
    fn alignment_holds_for_all_formats() {
        // (format, width alignment, height alignment, chroma height divisor)
        let table = [
            (HAL_PIXEL_FORMAT_RGBA_8888, 1, 1, None),
            (HAL_PIXEL_FORMAT_RGBX_8888, 1, 1, None),
            (HAL_PIXEL_FORMAT_BGRA_8888, 1, 1, None),
            (HAL_PIXEL_FORMAT_RGB_888, 1, 1, None),
            (HAL_PIXEL_FORMAT_RGB_565, 1, 1, None),
            (HAL_PIXEL_FORMAT_YCBCR_422_I, 2, 1, None),
            (HAL_PIXEL_FORMAT_DRM_NV12, 32, 2, Some(2)),
            (HAL_PIXEL_FORMAT_YV12, 32, 2, Some(2)),
            (HAL_PIXEL_FORMAT_YCBCR_422_SP, 2, 1, Some(1)),
            (HAL_PIXEL_FORMAT_YCRCB_420_SP, 2, 2, Some(2)),
        ];
        assert_eq!(table.len(), ALL_FORMATS.len());

        for (format, align_w, align_h, divisor) in table {
            assert_ne!(get_bpp(format), 0);
            assert_eq!(geometry_alignment(format), (align_w, align_h));
            for (w, h) in [(1, 1), (99, 77), (100, 100), (100, 101), (641, 479), (1920, 1080)] {
                let (aligned_w, aligned_h) = align_geometry(format, w, h).unwrap();
                assert_eq!(aligned_w % align_w, 0, "format {:#x} width {}", format, w);
                assert!(aligned_w >= w && aligned_w < w + align_w);

                // The luma plane is aligned, chroma rows are appended after it.
                let luma_h = align_upwards!(h, align_h);
                let expected_h = match divisor {
                    Some(divisor) => luma_h + luma_h / divisor,
                    None => luma_h,
                };
                assert_eq!(aligned_h, expected_h, "format {:#x} height {}", format, h);
            }
        }
    }

    #[test]
    fn nv12_fixture() {
        assert_eq!(
            align_geometry(HAL_PIXEL_FORMAT_DRM_NV12, 100, 100).unwrap(),
            (128, 150)
        );
        assert_eq!(
            align_geometry(HAL_PIXEL_FORMAT_DRM_NV12, 100, 101).unwrap(),
            (128, 153)
        );
    }

    #[test]
    fn planar_inflation() {
        assert_eq!(
            align_geometry(HAL_PIXEL_FORMAT_YCBCR_422_SP, 101, 101).unwrap(),
            (102, 202)
        );
        assert_eq!(
            align_geometry(HAL_PIXEL_FORMAT_YCRCB_420_SP, 101, 101).unwrap(),
            (102, 153)
        );
        assert_eq!(
            align_geometry(HAL_PIXEL_FORMAT_YCBCR_422_I, 101, 101).unwrap(),
            (102, 101)
        );
        assert_eq!(
            align_geometry(HAL_PIXEL_FORMAT_RGBA_8888, 101, 101).unwrap(),
            (101, 101)
        );
    }

    #[test]
    fn unknown_formats_pass_through() {
        assert_eq!(align_geometry(0x7f, 13, 17).unwrap(), (13, 17));
        assert!(matches!(
            BufferGeometry::new(0x7f, 13, 17),
            Err(GrallocError::UnsupportedFormat(0x7f))
        ));
    }

    #[test]
    fn oversized_dimensions() {
        assert!(align_geometry(HAL_PIXEL_FORMAT_DRM_NV12, u32::MAX, 2).is_err());
        assert!(BufferGeometry::new(HAL_PIXEL_FORMAT_RGBA_8888, u32::MAX, 1).is_err());
    }

    #[test]
    fn geometry() {
        let geometry = BufferGeometry::new(HAL_PIXEL_FORMAT_RGB_888, 10, 10).unwrap();
        assert_eq!(geometry.stride, 30);
        assert_eq!(geometry.size, 300);

        let geometry = BufferGeometry::new(HAL_PIXEL_FORMAT_DRM_NV12, 100, 100).unwrap();
        assert_eq!(geometry.width, 128);
        assert_eq!(geometry.height, 150);
        assert_eq!(geometry.stride, 128);
        assert_eq!(geometry.size, 128 * 150);
    }

    #[test]
    fn framebuffer_layouts() {
        let rgb = framebuffer_layout(HAL_PIXEL_FORMAT_BGRA_8888, 400, 100).unwrap();
        assert_eq!(rgb.drm_format, DrmFormat::from_bytes(DRM_FORMAT_ARGB8888));
        assert_eq!(rgb.num_planes, 1);
        assert_eq!(rgb.pitches, [400, 0, 0, 0]);
        assert_eq!(rgb.offsets, [0, 0, 0, 0]);

        let nv12 = framebuffer_layout(HAL_PIXEL_FORMAT_DRM_NV12, 128, 99).unwrap();
        assert_eq!(nv12.num_planes, 2);
        assert_eq!(nv12.pitches, [128, 128, 0, 0]);
        assert_eq!(nv12.offsets, [0, 128 * 100, 0, 0]);

        let yv12 = framebuffer_layout(HAL_PIXEL_FORMAT_YV12, 64, 32).unwrap();
        assert_eq!(yv12.drm_format, DrmFormat::from_bytes(DRM_FORMAT_YVU420));
        assert_eq!(yv12.num_planes, 3);
        assert_eq!(yv12.pitches, [64, 32, 32, 0]);
        assert_eq!(yv12.offsets, [0, 64 * 32, 64 * 32 + 32 * 16, 0]);

        assert!(framebuffer_layout(0x7f, 64, 32).is_err());
    }
}
