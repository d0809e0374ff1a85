//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face onto the canonical 112×112 ArcFace template using the
//! five InsightFace reference landmarks and a closed-form least-squares fit.

use crate::frame::Frame;
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit of `src` onto `dst`.
    ///
    /// Centering both point sets removes the translation, after which the
    /// rotation/scale pair has a closed form.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let mut norm = 0.0f32;
        let mut num_a = 0.0f32;
        let mut num_b = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            norm += sx * sx + sy * sy;
            num_a += sx * dx + sy * dy;
            num_b += sx * dy - sy * dx;
        }

        if norm < 1e-12 {
            // Degenerate landmarks (all coincident): translate only.
            return Self { a: 1.0, b: 0.0, tx: mdx - msx, ty: mdy - msy };
        }

        let a = num_a / norm;
        let b = num_b / norm;
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    /// Map an output (template) coordinate back into the source frame.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Bilinear sample of all three channels at a sub-pixel position.
fn bilinear(frame: &Frame, sx: f32, sy: f32) -> [u8; 3] {
    let x0 = sx.floor() as i32;
    let y0 = sy.floor() as i32;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let mut out = [0u8; 3];
    for (c, slot) in out.iter_mut().enumerate() {
        let val = frame.sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
            + frame.sample(x0 + 1, y0, c) * fx * (1.0 - fy)
            + frame.sample(x0, y0 + 1, c) * (1.0 - fx) * fy
            + frame.sample(x0 + 1, y0 + 1, c) * fx * fy;
        *slot = val.round().clamp(0.0, 255.0) as u8;
    }
    out
}

fn warp(frame: &Frame, transform: &Similarity, out_size: u32) -> RgbImage {
    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        match transform.invert_point(ox as f32, oy as f32) {
            Some((sx, sy)) => Rgb(bilinear(frame, sx, sy)),
            None => Rgb([0, 0, 0]),
        }
    })
}

/// Align a detected face to a canonical 112×112 RGB crop for ArcFace.
///
/// Pixels that map outside the source frame are black.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    warp(frame, &transform, ALIGNED_SIZE)
}
