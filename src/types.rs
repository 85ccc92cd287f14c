use serde::{Deserialize, Serialize};

/// A 2D point in pixel (or unit-square) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        (*self - *other).norm()
    }

    pub fn norm(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

impl std::ops::Add for Point {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::AddAssign for Point {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl std::ops::Sub for Point {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Mul<f32> for Point {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self::Output {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

/// Axis-aligned face region: top-left corner plus size, in full-frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Map a point from the unit square of this box into image coordinates.
    pub fn denormalize_point(&self, p: Point) -> Point {
        Point::new(self.x + p.x * self.width, self.y + p.y * self.height)
    }

    /// Map an image point into the unit square of this box.
    pub fn normalize_point(&self, p: Point) -> Point {
        Point::new((p.x - self.x) / self.width, (p.y - self.y) / self.height)
    }
}

/// An ordered set of landmark points, e.g. the 68 iBUG points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub points: Vec<Point>,
}

impl Shape {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn zeros(n: usize) -> Self {
        Self {
            points: vec![Point::default(); n],
        }
    }

    pub fn num_landmarks(&self) -> usize {
        self.points.len()
    }

    /// Build a shape from interleaved `[x0, y0, x1, y1, ...]` values.
    pub fn from_interleaved(values: &[f32]) -> Self {
        debug_assert!(values.len() % 2 == 0);
        Self::new(
            values
                .chunks_exact(2)
                .map(|xy| Point::new(xy[0], xy[1]))
                .collect(),
        )
    }

    /// Add another shape point-wise.
    pub fn add_delta(&mut self, delta: &Shape) {
        debug_assert_eq!(self.points.len(), delta.points.len());
        for (p, d) in self.points.iter_mut().zip(&delta.points) {
            *p += *d;
        }
    }

    pub fn centroid(&self) -> Point {
        if self.points.is_empty() {
            return Point::default();
        }
        let sum = self
            .points
            .iter()
            .fold(Point::default(), |acc, p| acc + *p);
        sum * (1.0 / self.points.len() as f32)
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = Point;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.points[idx]
    }
}

/// The six anatomical points every backend reports, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalLandmark {
    LeftEyeOuter,
    RightEyeOuter,
    NoseTip,
    MouthLeft,
    MouthRight,
    Chin,
}

impl CanonicalLandmark {
    pub const COUNT: usize = 6;

    pub const ALL: [CanonicalLandmark; Self::COUNT] = [
        Self::LeftEyeOuter,
        Self::RightEyeOuter,
        Self::NoseTip,
        Self::MouthLeft,
        Self::MouthRight,
        Self::Chin,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A detected face: its region and the six canonical landmarks in full-frame pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceCandidate {
    pub region: BoundingBox,
    pub landmarks: [Point; CanonicalLandmark::COUNT],
}

impl FaceCandidate {
    pub fn new(region: BoundingBox, landmarks: [Point; CanonicalLandmark::COUNT]) -> Self {
        Self { region, landmarks }
    }

    /// Select the canonical six from a dense landmark set using `indices`
    /// (given in canonical order). Returns `None` if the set is too small.
    pub fn from_dense(
        region: BoundingBox,
        dense: &[Point],
        indices: &[usize; CanonicalLandmark::COUNT],
    ) -> Option<Self> {
        let mut landmarks = [Point::default(); CanonicalLandmark::COUNT];
        for (slot, &idx) in landmarks.iter_mut().zip(indices) {
            *slot = *dense.get(idx)?;
        }
        Some(Self::new(region, landmarks))
    }

    pub fn landmark(&self, which: CanonicalLandmark) -> Point {
        self.landmarks[which.index()]
    }
}
