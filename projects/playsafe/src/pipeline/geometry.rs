use crate::pipeline::types::{BBox, Point};

/// Intersection over union of two pixel boxes
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = a.x2().min(b.x2());
    let y2 = a.y2().min(b.y2());

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

pub fn distance(a: Point, b: Point) -> f32 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// Angle at `vertex` between the rays towards `a` and `c`, in degrees.
/// Returns None when either ray has zero length.
pub fn angle_deg(a: Point, vertex: Point, c: Point) -> Option<f32> {
    let (ux, uy) = (a.x - vertex.x, a.y - vertex.y);
    let (vx, vy) = (c.x - vertex.x, c.y - vertex.y);
    let norm = (ux * ux + uy * uy).sqrt() * (vx * vx + vy * vy).sqrt();
    if norm <= f32::EPSILON {
        return None;
    }
    let cos = ((ux * vx + uy * vy) / norm).clamp(-1.0, 1.0);
    Some(cos.acos().to_degrees())
}

/// Horizontal offset of `p` from the line through `a` and `b`, measured at
/// the height of `p`. Positive means `p` lies to the right of the line.
pub fn horizontal_offset_from_line(p: Point, a: Point, b: Point) -> Option<f32> {
    let dy = b.y - a.y;
    if dy.abs() <= f32::EPSILON {
        return None;
    }
    let t = (p.y - a.y) / dy;
    let line_x = a.x + t * (b.x - a.x);
    Some(p.x - line_x)
}
