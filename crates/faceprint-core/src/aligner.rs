//! Face alignment via 4-DOF similarity transform.
//!
//! Normalizes an arbitrary face image into a fixed-size crop for the encoder:
//! by least-squares alignment of five detected landmarks onto the canonical
//! ArcFace template when landmarks are available, by bounding-box crop with
//! optional margin otherwise, or by a plain resize when neither is given.

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::types::{BoundingBox, Landmarks};

/// ArcFace reference landmarks for a 112×112 output, in canonical order:
/// left eye, right eye, nose tip, left mouth corner, right mouth corner.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

const REFERENCE_SIZE: f32 = 112.0;

/// Face aligner with a fixed output size and crop margin.
///
/// Construction scales the reference template once; after that every
/// [`preprocess`](Self::preprocess) call is a pure function of its inputs, so
/// one aligner can be shared freely across threads.
pub struct FaceAligner {
    image_size: u32,
    margin: f32,
    reference: [(f32, f32); 5],
}

impl FaceAligner {
    /// Create an aligner producing `image_size`² crops. `margin` is the
    /// fractional padding applied in bounding-box mode only.
    pub fn new(image_size: u32, margin: f32) -> Self {
        let scale = image_size as f32 / REFERENCE_SIZE;
        let mut reference = REFERENCE_LANDMARKS_112;
        for p in &mut reference {
            p.0 *= scale;
            p.1 *= scale;
        }
        Self { image_size, margin, reference }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Reference template scaled to the configured output size.
    pub fn reference(&self) -> &[(f32, f32); 5] {
        &self.reference
    }

    /// Normalize a face image to `image_size`².
    ///
    /// Dispatch, first match wins: landmarks → similarity-transform warp,
    /// bounding box → crop with margin, neither → plain resize. Never fails;
    /// degenerate boxes degrade to an all-black output.
    pub fn preprocess(
        &self,
        img: &RgbImage,
        bbox: Option<&BoundingBox>,
        landmarks: Option<&Landmarks>,
    ) -> RgbImage {
        if let Some(landmarks) = landmarks {
            let matrix = estimate_similarity_transform(landmarks.points(), &self.reference);
            warp_affine(img, &matrix, self.image_size)
        } else if let Some(bbox) = bbox {
            self.crop_with_margin(img, bbox)
        } else {
            imageops::resize(img, self.image_size, self.image_size, FilterType::Triangle)
        }
    }

    /// Crop a bounding box (expanded by the configured margin, clamped to the
    /// image) and resize it to the output size.
    ///
    /// A box with zero area after clamping yields an all-black output rather
    /// than an error.
    pub fn crop_with_margin(&self, img: &RgbImage, bbox: &BoundingBox) -> RgbImage {
        let (width, height) = img.dimensions();
        let (x1, y1, x2, y2) = expand_and_clamp(bbox, self.margin, width, height);

        if x2 <= x1 || y2 <= y1 {
            return RgbImage::new(self.image_size, self.image_size);
        }

        let crop = imageops::crop_imm(
            img,
            x1 as u32,
            y1 as u32,
            (x2 - x1) as u32,
            (y2 - y1) as u32,
        )
        .to_image();
        imageops::resize(&crop, self.image_size, self.image_size, FilterType::Triangle)
    }
}

/// Apply the margin expansion and clamp the box into the image bounds.
///
/// Expansion rounds `w·margin` / `h·margin` to the nearest pixel; clamping
/// happens after expansion, x against width and y against height. The
/// arithmetic runs in i64 so extreme corner coordinates cannot overflow
/// before the clamp narrows them back to image range.
fn expand_and_clamp(
    bbox: &BoundingBox,
    margin: f32,
    width: u32,
    height: u32,
) -> (i32, i32, i32, i32) {
    let (mut x1, mut y1, mut x2, mut y2) =
        (bbox.x1 as i64, bbox.y1 as i64, bbox.x2 as i64, bbox.y2 as i64);

    if margin > 0.0 {
        let dx = ((x2 - x1) as f64 * margin as f64).round() as i64;
        let dy = ((y2 - y1) as f64 * margin as f64).round() as i64;
        x1 = x1.saturating_sub(dx);
        x2 = x2.saturating_add(dx);
        y1 = y1.saturating_sub(dy);
        y2 = y2.saturating_add(dy);
    }

    (
        x1.clamp(0, width as i64) as i32,
        y1.clamp(0, height as i64) as i32,
        x2.clamp(0, width as i64) as i32,
        y2.clamp(0, height as i64) as i32,
    )
}

/// Estimate the 2×3 similarity transform mapping `src` onto `dst` in the
/// least-squares sense.
///
/// Each point pair contributes two rows to an over-determined system in the
/// unknowns (a, b, tx, ty):
/// ```text
/// sx·a − sy·b + tx = dx
/// sy·a + sx·b + ty = dy
/// ```
/// The normal equations are accumulated in f64 and solved by Gaussian
/// elimination with partial pivoting. Returns [a, -b, tx, b, a, ty], the
/// row-major matrix
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    let mut ata = [[0.0f64; 4]; 4];
    let mut atb = [0.0f64; 4];

    for i in 0..5 {
        let (sx, sy) = (src[i].0 as f64, src[i].1 as f64);
        let (dx, dy) = (dst[i].0 as f64, dst[i].1 as f64);

        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (row, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += row[j] * row[k];
                }
                atb[j] += row[j] * rhs;
            }
        }
    }

    let [a, b, tx, ty] = solve_normal_equations(&ata, &atb);
    [a as f32, -b as f32, tx as f32, b as f32, a as f32, ty as f32]
}

/// Solve the 4×4 normal equations via Gaussian elimination with partial
/// pivoting. A near-singular pivot (coincident or collinear landmarks)
/// degrades to an identity transform instead of failing.
#[allow(clippy::needless_range_loop)]
fn solve_normal_equations(ata: &[[f64; 4]; 4], atb: &[f64; 4]) -> [f64; 4] {
    // Augmented matrix [A | b] as 4x5
    let mut m = [[0.0f64; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut pivot_row = col;
        for row in (col + 1)..4 {
            if m[row][col].abs() > m[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    x
}

/// Inverse-mapped affine warp with bilinear interpolation.
///
/// `matrix` is [a, -b, tx, b, a, ty] mapping source to destination; each
/// destination pixel samples the source at the inverse location. Out-of-bounds
/// source pixels are black in every channel.
fn warp_affine(img: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    let mut out = RgbImage::new(out_size, out_size);

    // Invert the 2×2 similarity part: M = [[a, -b], [b, a]], det = a² + b².
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return out;
    }
    let ia = a / det;
    let ib = b / det;

    let (src_w, src_h) = img.dimensions();
    let sample = |x: i32, y: i32, c: usize| -> f32 {
        if x >= 0 && (x as u32) < src_w && y >= 0 && (y as u32) < src_h {
            img.get_pixel(x as u32, y as u32)[c] as f32
        } else {
            0.0
        }
    };

    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i32;
        let y0 = sy.floor() as i32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        for c in 0..3 {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            pixel[c] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    /// Apply the forward matrix [a, -b, tx, b, a, ty] to a point.
    fn apply(m: &[f32; 6], p: (f32, f32)) -> (f32, f32) {
        (
            m[0] * p.0 + m[1] * p.1 + m[2],
            m[3] * p.0 + m[4] * p.1 + m[5],
        )
    }

    #[test]
    fn test_identity_transform() {
        // When src == dst the fit should be the identity.
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a2 = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_recovers_known_similarity() {
        // Rotate, scale and translate the reference points by a known
        // transform; the fit must map them back onto the reference.
        let angle = 0.35f32;
        let scale = 1.7f32;
        let (tx, ty) = (23.0f32, -11.0f32);
        let (cos, sin) = (angle.cos() * scale, angle.sin() * scale);

        let mut src = REFERENCE_LANDMARKS_112;
        for p in &mut src {
            let (x, y) = *p;
            *p = (cos * x - sin * y + tx, sin * x + cos * y + ty);
        }

        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            let mapped = apply(&m, *s);
            assert!((mapped.0 - d.0).abs() < 1e-3, "x: {} vs {}", mapped.0, d.0);
            assert!((mapped.1 - d.1).abs() < 1e-3, "y: {} vs {}", mapped.1, d.1);
        }
    }

    #[test]
    fn test_degenerate_landmarks_produce_finite_transform() {
        // All five points coincident: singular system, must not panic and
        // must still yield finite coefficients.
        let src = [(50.0f32, 50.0); 5];
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!(m.iter().all(|v| v.is_finite()), "matrix = {m:?}");

        let aligner = FaceAligner::new(112, 0.0);
        let img = gradient_image(200, 200);
        let out = aligner.preprocess(&img, None, Some(&Landmarks::new(src)));
        assert_eq!(out.dimensions(), (112, 112));
    }

    #[test]
    fn test_collinear_landmarks_do_not_panic() {
        let src = [(10.0f32, 10.0), (20.0, 20.0), (30.0, 30.0), (40.0, 40.0), (50.0, 50.0)];
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!(m.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_warp_identity_matches_crop() {
        // An identity transform samples the source grid exactly, so the warp
        // equals the top-left crop.
        let img = gradient_image(200, 200);
        let m = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let out = warp_affine(&img, &m, 112);
        for (x, y, pixel) in out.enumerate_pixels() {
            assert_eq!(pixel, img.get_pixel(x, y), "mismatch at ({x}, {y})");
        }
    }

    #[test]
    fn test_warp_out_of_bounds_is_black() {
        // Translate far outside the source: every sample lands out of bounds.
        let img = gradient_image(50, 50);
        let m = [1.0, 0.0, 1000.0, 0.0, 1.0, 1000.0];
        let out = warp_affine(&img, &m, 112);
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_landmarks_at_reference_yield_near_identity_warp() {
        let aligner = FaceAligner::new(112, 0.0);
        let img = gradient_image(300, 300);
        let landmarks = Landmarks::new(*aligner.reference());
        let out = aligner.preprocess(&img, None, Some(&landmarks));

        assert_eq!(out.dimensions(), (112, 112));
        // Near-identity mapping: interior pixels should match the direct crop
        // within interpolation error.
        for y in (0..112).step_by(7) {
            for x in (0..112).step_by(7) {
                let got = out.get_pixel(x, y);
                let want = img.get_pixel(x, y);
                for c in 0..3 {
                    let diff = (got[c] as i32 - want[c] as i32).abs();
                    assert!(diff <= 2, "({x}, {y}) channel {c}: {} vs {}", got[c], want[c]);
                }
            }
        }
    }

    #[test]
    fn test_alignment_levels_the_eyes() {
        // Rotated face: after the fitted transform the two eye landmarks must
        // end up horizontally level at the reference rows.
        let angle = 0.4f32;
        let (cos, sin) = (angle.cos(), angle.sin());
        let mut src = REFERENCE_LANDMARKS_112;
        for p in &mut src {
            let (x, y) = (p.0 - 56.0, p.1 - 72.0);
            *p = (cos * x - sin * y + 150.0, sin * x + cos * y + 150.0);
        }

        let aligner = FaceAligner::new(112, 0.0);
        let m = estimate_similarity_transform(&src, aligner.reference());

        let left_eye = apply(&m, src[0]);
        let right_eye = apply(&m, src[1]);
        assert!(
            (left_eye.1 - right_eye.1).abs() < 0.5,
            "eye rows diverge: {} vs {}",
            left_eye.1,
            right_eye.1
        );
        assert!((left_eye.1 - 51.6963).abs() < 0.5);
    }

    #[test]
    fn test_landmarks_take_priority_over_bbox() {
        // Top-left 112x112 is red, the bbox region is blue. Landmarks at the
        // reference template give a near-identity warp, so a red output means
        // the landmark path won.
        let mut img = RgbImage::from_pixel(300, 300, Rgb([0, 0, 255]));
        for y in 0..112 {
            for x in 0..112 {
                img.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }

        let aligner = FaceAligner::new(112, 0.0);
        let landmarks = Landmarks::new(*aligner.reference());
        let bbox = BoundingBox { x1: 150, y1: 150, x2: 250, y2: 250 };
        let out = aligner.preprocess(&img, Some(&bbox), Some(&landmarks));

        let center = out.get_pixel(56, 56);
        assert_eq!(center.0, [255, 0, 0]);
    }

    #[test]
    fn test_bbox_crop_shape() {
        let aligner = FaceAligner::new(112, 0.0);
        let img = gradient_image(640, 480);
        let bbox = BoundingBox { x1: 100, y1: 100, x2: 300, y2: 300 };
        let out = aligner.preprocess(&img, Some(&bbox), None);
        assert_eq!(out.dimensions(), (112, 112));
    }

    #[test]
    fn test_zero_area_bbox_yields_black_image() {
        let aligner = FaceAligner::new(112, 0.0);
        let img = gradient_image(640, 480);

        for bbox in [
            BoundingBox { x1: 100, y1: 100, x2: 100, y2: 300 },
            BoundingBox { x1: 100, y1: 100, x2: 300, y2: 100 },
            // Entirely outside: clamps to zero area.
            BoundingBox { x1: 700, y1: 100, x2: 900, y2: 300 },
            // Inverted corners.
            BoundingBox { x1: 300, y1: 300, x2: 100, y2: 100 },
        ] {
            let out = aligner.preprocess(&img, Some(&bbox), None);
            assert_eq!(out.dimensions(), (112, 112));
            assert!(out.pixels().all(|p| p.0 == [0, 0, 0]), "bbox {bbox:?}");
        }
    }

    #[test]
    fn test_bbox_outside_bounds_is_clamped() {
        let aligner = FaceAligner::new(112, 0.5);
        let img = gradient_image(100, 80);
        let bbox = BoundingBox { x1: -50, y1: -50, x2: 400, y2: 400 };
        // Must not panic or index out of range.
        let out = aligner.preprocess(&img, Some(&bbox), None);
        assert_eq!(out.dimensions(), (112, 112));
    }

    #[test]
    fn test_extreme_coordinates_do_not_overflow() {
        // Corner values near the i32 limits must clamp, not wrap or panic,
        // even with the margin expansion applied first.
        let aligner = FaceAligner::new(112, 0.1);
        let img = gradient_image(640, 480);

        let bbox = BoundingBox {
            x1: -2_000_000_000,
            y1: -2_000_000_000,
            x2: 2_000_000_000,
            y2: 2_000_000_000,
        };
        let rect = expand_and_clamp(&bbox, 0.1, 640, 480);
        assert_eq!(rect, (0, 0, 640, 480));

        let out = aligner.preprocess(&img, Some(&bbox), None);
        assert_eq!(out.dimensions(), (112, 112));

        // Extremes in a single corner as well.
        let bbox = BoundingBox { x1: i32::MIN, y1: i32::MIN, x2: i32::MAX, y2: i32::MAX };
        let out = aligner.preprocess(&img, Some(&bbox), None);
        assert_eq!(out.dimensions(), (112, 112));
    }

    #[test]
    fn test_margin_expansion_example() {
        // 640x480, bbox (100,100,300,300), margin 0.1: w = h = 200, expands
        // by 20 per side to (80,80,320,320), within bounds.
        let bbox = BoundingBox { x1: 100, y1: 100, x2: 300, y2: 300 };
        let rect = expand_and_clamp(&bbox, 0.1, 640, 480);
        assert_eq!(rect, (80, 80, 320, 320));
    }

    #[test]
    fn test_margin_growth_is_monotonic() {
        let bbox = BoundingBox { x1: 200, y1: 150, x2: 400, y2: 330 };
        let mut prev_area = 0i64;
        for step in 0..20 {
            let margin = step as f32 * 0.05;
            let (x1, y1, x2, y2) = expand_and_clamp(&bbox, margin, 640, 480);
            let area = (x2 - x1) as i64 * (y2 - y1) as i64;
            assert!(area >= prev_area, "margin {margin}: {area} < {prev_area}");
            prev_area = area;
        }
    }

    #[test]
    fn test_margin_zero_leaves_box_unchanged() {
        let bbox = BoundingBox { x1: 10, y1: 20, x2: 30, y2: 40 };
        assert_eq!(expand_and_clamp(&bbox, 0.0, 100, 100), (10, 20, 30, 40));
    }

    #[test]
    fn test_no_bbox_no_landmarks_resizes_whole_image() {
        let aligner = FaceAligner::new(112, 0.0);
        let img = RgbImage::from_pixel(640, 480, Rgb([9, 77, 200]));
        let out = aligner.preprocess(&img, None, None);
        assert_eq!(out.dimensions(), (112, 112));
        // Uniform input stays uniform through resize.
        assert!(out.pixels().all(|p| p.0 == [9, 77, 200]));
    }

    #[test]
    fn test_preprocess_is_idempotent() {
        let aligner = FaceAligner::new(112, 0.1);
        let img = gradient_image(640, 480);
        let bbox = BoundingBox { x1: 100, y1: 100, x2: 300, y2: 300 };
        let landmarks = Landmarks::new([
            (150.0, 180.0),
            (250.0, 180.0),
            (200.0, 220.0),
            (170.0, 270.0),
            (230.0, 270.0),
        ]);

        let a = aligner.preprocess(&img, Some(&bbox), None);
        let b = aligner.preprocess(&img, Some(&bbox), None);
        assert_eq!(a.as_raw(), b.as_raw());

        let c = aligner.preprocess(&img, None, Some(&landmarks));
        let d = aligner.preprocess(&img, None, Some(&landmarks));
        assert_eq!(c.as_raw(), d.as_raw());
    }

    #[test]
    fn test_reference_scales_with_image_size() {
        let aligner = FaceAligner::new(224, 0.0);
        let reference = aligner.reference();
        assert!((reference[0].0 - 2.0 * 38.2946).abs() < 1e-4);
        assert!((reference[4].1 - 2.0 * 92.2041).abs() < 1e-4);
    }
}
