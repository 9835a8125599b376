//! Image decoding and preprocessing for the detection/embedding models

use anyhow::{anyhow, bail, Result};
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb};
use ndarray::Array4;

/// Input size expected by the ArcFace embedder.
pub const EMBEDDER_INPUT_SIZE: (u32, u32) = (112, 112);

/// Decode uploaded bytes into a raster image.
///
/// Fails on empty, truncated, or unrecognizable input; malformed bytes are
/// never repaired into a best-effort raster. EXIF orientation is applied
/// after a successful decode so phone captures come out upright.
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    if data.is_empty() {
        bail!("empty image payload");
    }
    let image = image::load_from_memory(data)
        .map_err(|e| anyhow!("failed to decode image (unsupported format or corrupt file): {e}"))?;
    Ok(apply_exif_orientation(data, image))
}

/// Apply the EXIF orientation tag, if any, to correct image rotation.
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    use std::io::Cursor;

    let orientation = exif::Reader::new()
        .read_from_container(&mut Cursor::new(data))
        .ok()
        .and_then(|exif_data| {
            exif_data
                .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .unwrap_or(1);

    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Letterbox geometry: scale and offsets from resizing with padding, kept
/// around so detections can be projected back into original coordinates.
pub struct ResizeInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ResizeInfo {
    pub fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w as f32,
            target_h as f32 / orig_h as f32,
        );
        let new_w = (orig_w as f32 * scale) as u32;
        let new_h = (orig_h as f32 * scale) as u32;

        Self {
            scale,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    /// Map a point in detector input space back to original image space.
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// Resize with aspect-ratio preservation onto a black canvas.
pub fn resize_with_padding(image: &DynamicImage, target_w: u32, target_h: u32) -> DynamicImage {
    let info = ResizeInfo::new(image.dimensions(), (target_w, target_h));
    let new_w = (image.width() as f32 * info.scale) as u32;
    let new_h = (image.height() as f32 * info.scale) as u32;

    let resized = image
        .resize_exact(new_w, new_h, image::imageops::FilterType::Lanczos3)
        .to_rgb8();

    let mut padded = ImageBuffer::from_pixel(target_w, target_h, Rgb([0u8, 0, 0]));
    for (x, y, pixel) in resized.enumerate_pixels() {
        padded.put_pixel(x + info.offset_x, y + info.offset_y, *pixel);
    }

    DynamicImage::ImageRgb8(padded)
}

/// Convert an image to a 1xCxHxW tensor with InsightFace conventions:
/// BGR channel order, (x - 127.5) / 128 normalization. This layout is a
/// fixed contract with the models, not configurable per request.
pub fn image_to_nchw(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        // channel 0 = B, 1 = G, 2 = R
        tensor[[0, 0, y, x]] = (pixel[2] as f32 - 127.5) / 128.0;
        tensor[[0, 1, y, x]] = (pixel[1] as f32 - 127.5) / 128.0;
        tensor[[0, 2, y, x]] = (pixel[0] as f32 - 127.5) / 128.0;
    }
    tensor
}

/// Canonical 5-point landmark positions for a 112x112 aligned face crop
/// (InsightFace standard: eyes, nose tip, mouth corners).
const ALIGN_DST: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Warp the face described by 5-point landmarks into the canonical 112x112
/// crop expected by the embedder.
pub fn align_face(image: &DynamicImage, landmarks: &[(f32, f32); 5]) -> Result<DynamicImage> {
    let transform = estimate_similarity(landmarks, &ALIGN_DST)?;
    let (w, h) = EMBEDDER_INPUT_SIZE;
    Ok(warp_affine(image, &transform, w, h))
}

/// Least-squares similarity transform (scale + rotation + translation)
/// mapping `src` onto `dst`, as a 2x3 matrix. Umeyama's method with a
/// closed-form 2x2 SVD.
fn estimate_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Result<[[f32; 3]; 2]> {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (src_cx, src_cy) = mean(src);
    let (dst_cx, dst_cy) = mean(dst);

    // Source variance and the dst^T * src covariance matrix.
    let mut var_src = 0.0f32;
    let (mut s00, mut s01, mut s10, mut s11) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    for i in 0..src.len() {
        let (sx, sy) = (src[i].0 - src_cx, src[i].1 - src_cy);
        let (dx, dy) = (dst[i].0 - dst_cx, dst[i].1 - dst_cy);
        var_src += sx * sx + sy * sy;
        s00 += dx * sx;
        s01 += dx * sy;
        s10 += dy * sx;
        s11 += dy * sy;
    }
    var_src /= n;
    s00 /= n;
    s01 /= n;
    s10 /= n;
    s11 /= n;

    if var_src <= 1e-10 {
        bail!("degenerate landmarks: zero variance");
    }

    // Closed-form SVD of the 2x2 covariance matrix.
    let e = (s00 + s11) / 2.0;
    let f = (s00 - s11) / 2.0;
    let g = (s10 + s01) / 2.0;
    let h = (s10 - s01) / 2.0;
    let q = (e * e + h * h).sqrt();
    let r = (f * f + g * g).sqrt();
    let (sv1, sv2) = (q + r, (q - r).abs());
    let theta = (g.atan2(f) - h.atan2(e)) / 2.0;
    let phi = (g.atan2(f) + h.atan2(e)) / 2.0;

    let det = s00 * s11 - s01 * s10;
    // R = U * diag(1, sign(det)) * V^T; the sign guard prevents reflections.
    let (r00, r01, r10, r11) = if det >= 0.0 {
        let a = phi - theta;
        (a.cos(), -a.sin(), a.sin(), a.cos())
    } else {
        let a = phi + theta;
        (a.cos(), a.sin(), a.sin(), -a.cos())
    };

    let trace = if det >= 0.0 { sv1 + sv2 } else { sv1 - sv2 };
    let scale = trace / var_src;

    let tx = dst_cx - scale * (r00 * src_cx + r01 * src_cy);
    let ty = dst_cy - scale * (r10 * src_cx + r11 * src_cy);

    Ok([
        [scale * r00, scale * r01, tx],
        [scale * r10, scale * r11, ty],
    ])
}

/// Apply a 2x3 affine transform by backward mapping with bilinear sampling.
fn warp_affine(
    image: &DynamicImage,
    transform: &[[f32; 3]; 2],
    out_width: u32,
    out_height: u32,
) -> DynamicImage {
    let rgb = image.to_rgb8();
    let mut output = ImageBuffer::from_pixel(out_width, out_height, Rgb([0u8, 0, 0]));

    let det = transform[0][0] * transform[1][1] - transform[0][1] * transform[1][0];
    let inv = [
        [transform[1][1] / det, -transform[0][1] / det],
        [-transform[1][0] / det, transform[0][0] / det],
    ];

    for y in 0..out_height {
        for x in 0..out_width {
            let dx = x as f32 - transform[0][2];
            let dy = y as f32 - transform[1][2];
            let src_x = inv[0][0] * dx + inv[0][1] * dy;
            let src_y = inv[1][0] * dx + inv[1][1] * dy;

            if src_x < 0.0
                || src_y < 0.0
                || src_x >= (rgb.width() - 1) as f32
                || src_y >= (rgb.height() - 1) as f32
            {
                continue;
            }

            let (x0, y0) = (src_x as u32, src_y as u32);
            let (fx, fy) = (src_x - x0 as f32, src_y - y0 as f32);
            let p00 = rgb.get_pixel(x0, y0);
            let p10 = rgb.get_pixel(x0 + 1, y0);
            let p01 = rgb.get_pixel(x0, y0 + 1);
            let p11 = rgb.get_pixel(x0 + 1, y0 + 1);

            let mut pixel = [0u8; 3];
            for c in 0..3 {
                let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + p10[c] as f32 * fx * (1.0 - fy)
                    + p01[c] as f32 * (1.0 - fx) * fy
                    + p11[c] as f32 * fx * fy;
                pixel[c] = v.clamp(0.0, 255.0) as u8;
            }
            output.put_pixel(x, y, Rgb(pixel));
        }
    }

    DynamicImage::ImageRgb8(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            Rgb([40, 80, 120]),
        ));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(decode_image(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_image(b"definitely not an image").is_err());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let mut bytes = png_bytes(16, 16);
        bytes.truncate(bytes.len() / 2);
        assert!(decode_image(&bytes).is_err());
    }

    #[test]
    fn test_decode_valid_png() {
        let image = decode_image(&png_bytes(16, 8)).unwrap();
        assert_eq!(image.dimensions(), (16, 8));
    }

    #[test]
    fn test_resize_info_round_trip() {
        let info = ResizeInfo::new((1280, 720), (640, 640));
        // A point in the original image, projected into letterbox space,
        // should map back to itself.
        let (x, y) = (200.0f32, 300.0f32);
        let boxed = (
            x * info.scale + info.offset_x as f32,
            y * info.scale + info.offset_y as f32,
        );
        let (bx, by) = info.to_original(boxed.0, boxed.1);
        assert!((bx - x).abs() < 1e-3);
        assert!((by - y).abs() < 1e-3);
    }

    #[test]
    fn test_resize_with_padding_dimensions() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::new(100, 50));
        let padded = resize_with_padding(&image, 64, 64);
        assert_eq!(padded.dimensions(), (64, 64));
    }

    #[test]
    fn test_nchw_layout_and_normalization() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            2,
            2,
            Rgb([255, 128, 0]),
        ));
        let tensor = image_to_nchw(&image);
        assert_eq!(tensor.shape(), &[1, 3, 2, 2]);
        // BGR order: channel 0 carries the blue value 0.
        assert!((tensor[[0, 0, 0, 0]] - (0.0 - 127.5) / 128.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] - (128.0 - 127.5) / 128.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - (255.0 - 127.5) / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_identity_alignment() {
        // Landmarks already at the canonical positions produce a transform
        // close to identity.
        let transform = estimate_similarity(&ALIGN_DST, &ALIGN_DST).unwrap();
        assert!((transform[0][0] - 1.0).abs() < 1e-4);
        assert!((transform[1][1] - 1.0).abs() < 1e-4);
        assert!(transform[0][1].abs() < 1e-4);
        assert!(transform[0][2].abs() < 1e-3);
    }

    #[test]
    fn test_similarity_recovers_scale_and_shift() {
        let mut src = ALIGN_DST;
        for p in src.iter_mut() {
            p.0 = p.0 * 2.0 + 10.0;
            p.1 = p.1 * 2.0 + 20.0;
        }
        let t = estimate_similarity(&src, &ALIGN_DST).unwrap();
        // Mapping a src point through t should land on the destination.
        for (s, d) in src.iter().zip(ALIGN_DST.iter()) {
            let mx = t[0][0] * s.0 + t[0][1] * s.1 + t[0][2];
            let my = t[1][0] * s.0 + t[1][1] * s.1 + t[1][2];
            assert!((mx - d.0).abs() < 1e-2);
            assert!((my - d.1).abs() < 1e-2);
        }
    }

    #[test]
    fn test_align_face_output_size() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::new(200, 200));
        let landmarks = [
            (70.0, 90.0),
            (130.0, 90.0),
            (100.0, 125.0),
            (78.0, 160.0),
            (122.0, 160.0),
        ];
        let aligned = align_face(&image, &landmarks).unwrap();
        assert_eq!(aligned.dimensions(), EMBEDDER_INPUT_SIZE);
    }
}
