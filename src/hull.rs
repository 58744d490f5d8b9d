//! Boundary selection over keyframe positions, projected on the XY plane.

use nalgebra as na;

fn cross(o: &na::Vector2<f64>, a: &na::Vector2<f64>, b: &na::Vector2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Indices of the convex hull vertices, ascending. Points on hull edges are not vertices.
pub fn convex_hull(points: &[na::Vector2<f64>]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| {
        points[a]
            .x
            .total_cmp(&points[b].x)
            .then(points[a].y.total_cmp(&points[b].y))
            .then(a.cmp(&b))
    });
    order.dedup_by(|a, b| points[*a] == points[*b]);
    if order.len() < 3 {
        let mut idx = order;
        idx.sort_unstable();
        return idx;
    }

    // Andrew's monotone chain
    let mut hull: Vec<usize> = Vec::with_capacity(2 * order.len());
    for &i in order.iter() {
        while hull.len() >= 2
            && cross(&points[hull[hull.len() - 2]], &points[hull[hull.len() - 1]], &points[i]) <= 0.0
        {
            hull.pop();
        }
        hull.push(i);
    }
    let lower_len = hull.len() + 1;
    for &i in order.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(&points[hull[hull.len() - 2]], &points[hull[hull.len() - 1]], &points[i]) <= 0.0
        {
            hull.pop();
        }
        hull.push(i);
    }
    hull.pop();
    hull.sort_unstable();
    hull.dedup();
    hull
}

/// Indices of the vertices of the alpha shape boundary, ascending.
///
/// An edge `(p, q)` is on the boundary when one of the two circles of radius
/// `alpha` through `p` and `q` holds no other point.
pub fn concave_hull(points: &[na::Vector2<f64>], alpha: f64) -> Vec<usize> {
    let n = points.len();
    if n < 3 || alpha <= 0.0 {
        return (0..n).collect();
    }
    let reach2 = 4.0 * alpha * alpha;
    let neighbors: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| j != i && (points[j] - points[i]).norm_squared() <= reach2)
                .collect()
        })
        .collect();

    let alpha2 = alpha * alpha;
    let mut on_boundary = vec![false; n];
    for i in 0..n {
        for &j in neighbors[i].iter().filter(|&&j| j > i) {
            let (p, q) = (points[i], points[j]);
            let chord = q - p;
            let d2 = chord.norm_squared();
            if d2 < 1e-18 {
                continue;
            }
            let mid = (p + q) * 0.5;
            let h = (alpha2 - d2 / 4.0).max(0.0).sqrt();
            let offset = na::Vector2::new(-chord.y, chord.x) / d2.sqrt() * h;
            let empty = |center: na::Vector2<f64>| {
                neighbors[i].iter().all(|&k| {
                    k == j || points[k] == p || points[k] == q
                        || (points[k] - center).norm_squared() >= alpha2 * (1.0 - 1e-9)
                })
            };
            if empty(mid + offset) || empty(mid - offset) {
                on_boundary[i] = true;
                on_boundary[j] = true;
            }
        }
    }
    (0..n).filter(|&i| on_boundary[i]).collect()
}
