//! Spatial filters.
//!
//! A [`SpatialFilter`] pairs a region of interest (ROI) with a topological
//! operator. The operator is evaluated as `roi <op> candidate`, using the
//! DE-9IM relation computed by `geo`. The ROI envelope is computed once at
//! build time and used to reject far-away candidates before the full
//! relation is computed.
//!
//! `WithinDistance` is planar: the distance is in the units of the
//! coordinates.

use geo::{
    BooleanOps, BoundingRect, Closest, ClosestPoint, Coord, Geometry, Intersects, MultiPolygon,
    Point, Rect, Relate,
};

use crate::builder::Draft;
use crate::error::{Error, Result};

/// Topological operator of a spatial filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpatialOp {
    #[default]
    Intersects,
    Overlaps,
    Crosses,
    Touches,
    Contains,
    Equals,
    Within,
    Disjoint,
    WithinDistance,
}

/// Filter on geometries.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialFilter {
    op: SpatialOp,
    roi: Geometry<f64>,
    center: Option<Point<f64>>,
    distance: Option<f64>,
    envelope: Option<Rect<f64>>,
}

impl SpatialFilter {
    pub fn builder() -> SpatialFilterBuilder {
        SpatialFilterBuilder {
            draft: Draft::new("SpatialFilter", PartialSpatial::default()),
        }
    }

    /// Candidates intersecting `bbox`.
    pub fn bbox(bbox: Rect<f64>) -> Self {
        Self {
            op: SpatialOp::Intersects,
            envelope: Some(bbox),
            roi: Geometry::Rect(bbox),
            center: None,
            distance: None,
        }
    }

    pub fn op(&self) -> SpatialOp {
        self.op
    }

    pub fn roi(&self) -> &Geometry<f64> {
        &self.roi
    }

    /// Center point of a `WithinDistance` filter.
    pub fn center(&self) -> Option<&Point<f64>> {
        self.center.as_ref()
    }

    pub fn distance(&self) -> Option<f64> {
        self.distance
    }

    /// Bounding rectangle of the ROI.
    pub fn envelope(&self) -> Option<&Rect<f64>> {
        self.envelope.as_ref()
    }

    /// Whether `geom` satisfies the operator against the ROI.
    pub fn test(&self, geom: &Geometry<f64>) -> bool {
        if let (SpatialOp::WithinDistance, Some(center), Some(distance)) =
            (self.op, self.center, self.distance)
        {
            return match distance_to(geom, &center) {
                Some(d) => d <= distance,
                None => false,
            };
        }

        let envelopes_meet = match (self.envelope.as_ref(), geom.bounding_rect()) {
            (Some(env), Some(other)) => env.intersects(&other),
            _ => false,
        };
        if !envelopes_meet {
            return self.op == SpatialOp::Disjoint;
        }

        let matrix = self.roi.relate(geom);
        match self.op {
            SpatialOp::Intersects => matrix.is_intersects(),
            SpatialOp::Overlaps => matrix.is_overlaps(),
            SpatialOp::Crosses => matrix.is_crosses(),
            SpatialOp::Touches => matrix.is_touches(),
            SpatialOp::Contains => matrix.is_contains(),
            SpatialOp::Equals => matrix.is_equal_topo(),
            SpatialOp::Within => matrix.is_within(),
            SpatialOp::Disjoint => matrix.is_disjoint(),
            SpatialOp::WithinDistance => false,
        }
    }

    pub fn intersect(&self, other: &SpatialFilter) -> Result<SpatialFilter> {
        intersect_spatial(self, other)
    }
}

/// Planar distance from `center` to the closest point of `geom`.
fn distance_to(geom: &Geometry<f64>, center: &Point<f64>) -> Option<f64> {
    match geom.closest_point(center) {
        Closest::Intersection(_) => Some(0.0),
        Closest::SinglePoint(p) => Some((p.x() - center.x()).hypot(p.y() - center.y())),
        Closest::Indeterminate => None,
    }
}

fn as_multipolygon(geom: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geom {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        Geometry::Rect(r) => Some(MultiPolygon::new(vec![r.to_polygon()])),
        Geometry::Triangle(t) => Some(MultiPolygon::new(vec![t.to_polygon()])),
        _ => None,
    }
}

/// ANDs two spatial filters.
///
/// Only `Intersects ∩ Intersects` over polygonal ROIs is supported: the
/// result intersects the geometric intersection of the two ROIs.
pub fn intersect_spatial(a: &SpatialFilter, b: &SpatialFilter) -> Result<SpatialFilter> {
    if a.op != SpatialOp::Intersects || b.op != SpatialOp::Intersects {
        return Err(Error::Unsupported(format!(
            "intersection of {:?} and {:?} spatial filters",
            a.op, b.op
        )));
    }
    let (pa, pb) = match (as_multipolygon(&a.roi), as_multipolygon(&b.roi)) {
        (Some(pa), Some(pb)) => (pa, pb),
        _ => {
            return Err(Error::Unsupported(
                "intersection of non-polygonal regions".to_string(),
            ))
        }
    };

    let mut shared = pa.intersection(&pb);
    let roi = match shared.0.len() {
        0 => return Err(Error::empty("spatial regions do not overlap")),
        1 => Geometry::Polygon(shared.0.remove(0)),
        _ => Geometry::MultiPolygon(shared),
    };
    SpatialFilter::builder().with_roi(roi).build()
}

#[derive(Debug, Default)]
struct PartialSpatial {
    op: Option<SpatialOp>,
    roi: Option<Geometry<f64>>,
    center: Option<Point<f64>>,
    distance: Option<f64>,
}

/// Builder for [`SpatialFilter`].
#[derive(Debug)]
pub struct SpatialFilterBuilder {
    draft: Draft<PartialSpatial>,
}

impl SpatialFilterBuilder {
    pub fn with_roi(&mut self, roi: impl Into<Geometry<f64>>) -> &mut Self {
        let roi = roi.into();
        self.draft.edit(|s| s.roi = Some(roi));
        self
    }

    /// Intersects `bbox`.
    pub fn with_bbox(&mut self, bbox: Rect<f64>) -> &mut Self {
        self.draft.edit(|s| {
            s.roi = Some(Geometry::Rect(bbox));
            s.op = Some(SpatialOp::Intersects);
        });
        self
    }

    pub fn with_op(&mut self, op: SpatialOp) -> &mut Self {
        self.draft.edit(|s| s.op = Some(op));
        self
    }

    /// Within `distance` of `center`.
    pub fn with_distance(&mut self, center: Point<f64>, distance: f64) -> &mut Self {
        self.draft.edit(|s| {
            s.op = Some(SpatialOp::WithinDistance);
            s.center = Some(center);
            s.distance = Some(distance);
            s.roi = Some(Geometry::Rect(Rect::new(
                Coord {
                    x: center.x() - distance,
                    y: center.y() - distance,
                },
                Coord {
                    x: center.x() + distance,
                    y: center.y() + distance,
                },
            )));
        });
        self
    }

    pub fn build(&mut self) -> Result<SpatialFilter> {
        let s = self.draft.take()?;
        let op = s.op.unwrap_or_default();
        if op == SpatialOp::WithinDistance {
            match s.distance {
                Some(d) if d >= 0.0 && s.center.is_some() => {}
                _ => {
                    return Err(Error::validation(
                        "within-distance filter needs a center and a distance >= 0",
                    ))
                }
            }
        }
        let roi = s
            .roi
            .ok_or_else(|| Error::validation("spatial filter needs a region of interest"))?;
        Ok(SpatialFilter {
            op,
            envelope: roi.bounding_rect(),
            roi,
            center: s.center,
            distance: s.distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{coord, line_string, point, polygon};

    fn square(x0: f64, y0: f64, size: f64) -> Rect<f64> {
        Rect::new(coord! { x: x0, y: y0 }, coord! { x: x0 + size, y: y0 + size })
    }

    #[test]
    fn test_bbox_intersects() {
        let f = SpatialFilter::bbox(square(0.0, 0.0, 10.0));
        assert!(f.test(&point!(x: 5.0, y: 5.0).into()));
        assert!(!f.test(&point!(x: 15.0, y: 5.0).into()));
        assert!(f.test(&line_string![(x: -5.0, y: 5.0), (x: 5.0, y: 5.0)].into()));
    }

    #[test]
    fn test_contains_and_within_direction() {
        let contains = SpatialFilter::builder()
            .with_roi(square(0.0, 0.0, 10.0))
            .with_op(SpatialOp::Contains)
            .build()
            .unwrap();
        assert!(contains.test(&point!(x: 2.0, y: 2.0).into()));
        assert!(!contains.test(&Geometry::Rect(square(5.0, 5.0, 10.0))));

        let within = SpatialFilter::builder()
            .with_roi(point!(x: 2.0, y: 2.0))
            .with_op(SpatialOp::Within)
            .build()
            .unwrap();
        assert!(within.test(&Geometry::Rect(square(0.0, 0.0, 10.0))));
    }

    #[test]
    fn test_disjoint_uses_envelope_shortcut() {
        let f = SpatialFilter::builder()
            .with_roi(square(0.0, 0.0, 1.0))
            .with_op(SpatialOp::Disjoint)
            .build()
            .unwrap();
        assert!(f.test(&point!(x: 50.0, y: 50.0).into()));
        assert!(!f.test(&point!(x: 0.5, y: 0.5).into()));
    }

    #[test]
    fn test_within_distance() {
        let f = SpatialFilter::builder()
            .with_distance(point!(x: 0.0, y: 0.0), 5.0)
            .build()
            .unwrap();
        assert!(f.test(&point!(x: 3.0, y: 4.0).into()));
        assert!(!f.test(&point!(x: 4.0, y: 4.0).into()));
    }

    #[test]
    fn test_distance_operator_requires_distance() {
        let err = SpatialFilter::builder()
            .with_roi(point!(x: 0.0, y: 0.0))
            .with_op(SpatialOp::WithinDistance)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_intersect_polygons() {
        let a = SpatialFilter::bbox(square(0.0, 0.0, 10.0));
        let b = SpatialFilter::bbox(square(5.0, 5.0, 10.0));
        let c = a.intersect(&b).unwrap();
        let env = c.envelope().unwrap();
        assert_eq!(env.min(), coord! { x: 5.0, y: 5.0 });
        assert_eq!(env.max(), coord! { x: 10.0, y: 10.0 });

        let far = SpatialFilter::bbox(square(50.0, 50.0, 1.0));
        assert!(matches!(a.intersect(&far), Err(Error::EmptyIntersection(_))));
    }

    #[test]
    fn test_intersect_unsupported_cases() {
        let tri = SpatialFilter::builder()
            .with_roi(polygon![(x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 0.0, y: 4.0)])
            .with_op(SpatialOp::Within)
            .build()
            .unwrap();
        let a = SpatialFilter::bbox(square(0.0, 0.0, 10.0));
        assert!(matches!(a.intersect(&tri), Err(Error::Unsupported(_))));

        let pt = SpatialFilter::builder()
            .with_roi(point!(x: 1.0, y: 1.0))
            .build()
            .unwrap();
        assert!(matches!(a.intersect(&pt), Err(Error::Unsupported(_))));
    }
}
