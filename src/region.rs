//! Rectangles and rectangle sets over the framebuffer coordinate space.
//!
//! A [`Region`] is kept in a canonical banded form: rectangles are sorted
//! top to bottom, then left to right; all rectangles of one horizontal band
//! share the same top and bottom edge; rectangles inside a band never touch;
//! two vertically adjacent bands never carry the same set of spans. Two
//! regions covering the same pixels therefore compare equal.

/// A point, or a translation vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn translate(self, delta: Point) -> Self {
        Self {
            x: self.x + delta.x,
            y: self.y + delta.y,
        }
    }

    pub fn negate(self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
        }
    }
}

/// An axis aligned rectangle, `br` is exclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub tl: Point,
    pub br: Point,
}

impl Rect {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            tl: Point::new(x1, y1),
            br: Point::new(x2, y2),
        }
    }

    pub const fn from_xywh(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    pub fn width(&self) -> i32 {
        self.br.x - self.tl.x
    }

    pub fn height(&self) -> i32 {
        self.br.y - self.tl.y
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width() as i64 * self.height() as i64
        }
    }

    /// The overlapping part of both rectangles, empty if they do not meet
    pub fn intersect(&self, other: &Rect) -> Rect {
        let r = Rect::new(
            self.tl.x.max(other.tl.x),
            self.tl.y.max(other.tl.y),
            self.br.x.min(other.br.x),
            self.br.y.min(other.br.y),
        );
        if r.is_empty() {
            Rect::default()
        } else {
            r
        }
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn enclosed_by(&self, other: &Rect) -> bool {
        self.tl.x >= other.tl.x
            && self.tl.y >= other.tl.y
            && self.br.x <= other.br.x
            && self.br.y <= other.br.y
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.tl.x && p.x < self.br.x && p.y >= self.tl.y && p.y < self.br.y
    }

    pub fn translate(&self, delta: Point) -> Rect {
        Rect {
            tl: self.tl.translate(delta),
            br: self.br.translate(delta),
        }
    }

    /// The smallest rectangle containing both
    pub fn union_boundary(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::new(
            self.tl.x.min(other.tl.x),
            self.tl.y.min(other.tl.y),
            self.br.x.max(other.br.x),
            self.br.y.max(other.br.y),
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Union,
    Intersect,
    Subtract,
}

impl Op {
    fn apply(self, a: bool, b: bool) -> bool {
        match self {
            Op::Union => a || b,
            Op::Intersect => a && b,
            Op::Subtract => a && !b,
        }
    }
}

type Span = (i32, i32);

/// A set of non-overlapping rectangles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl From<Rect> for Region {
    fn from(r: Rect) -> Self {
        if r.is_empty() {
            Self::new()
        } else {
            Self { rects: vec![r] }
        }
    }
}

impl FromIterator<Rect> for Region {
    fn from_iter<T: IntoIterator<Item = Rect>>(iter: T) -> Self {
        let mut region = Region::new();
        for r in iter {
            region.assign_union(&Region::from(r));
        }
        region
    }
}

impl Region {
    pub fn new() -> Self {
        Self { rects: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Replace the content with a single rectangle
    pub fn reset(&mut self, r: Rect) {
        *self = Region::from(r);
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn num_rects(&self) -> usize {
        self.rects.len()
    }

    pub fn area(&self) -> i64 {
        self.rects.iter().map(Rect::area).sum()
    }

    pub fn bounding_rect(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::default(), |acc, r| acc.union_boundary(r))
    }

    pub fn contains(&self, p: Point) -> bool {
        self.rects.iter().any(|r| r.contains(p))
    }

    pub fn union(&self, other: &Region) -> Region {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        combine(self, other, Op::Union)
    }

    pub fn intersect(&self, other: &Region) -> Region {
        if self.is_empty() || other.is_empty() {
            return Region::new();
        }
        combine(self, other, Op::Intersect)
    }

    pub fn subtract(&self, other: &Region) -> Region {
        if self.is_empty() || other.is_empty() {
            return self.clone();
        }
        combine(self, other, Op::Subtract)
    }

    pub fn intersect_rect(&self, r: Rect) -> Region {
        self.intersect(&Region::from(r))
    }

    pub fn assign_union(&mut self, other: &Region) {
        *self = self.union(other);
    }

    pub fn assign_intersect(&mut self, other: &Region) {
        *self = self.intersect(other);
    }

    pub fn assign_subtract(&mut self, other: &Region) {
        *self = self.subtract(other);
    }

    pub fn translate(&mut self, delta: Point) {
        for r in self.rects.iter_mut() {
            *r = r.translate(delta);
        }
    }

    pub fn translated(&self, delta: Point) -> Region {
        let mut r = self.clone();
        r.translate(delta);
        r
    }

    /// The rectangles in the requested walking order, bands stay atomic
    pub fn rects_ordered(&self, left_to_right: bool, top_to_bottom: bool) -> Vec<Rect> {
        let mut bands: Vec<&[Rect]> = self
            .rects
            .chunk_by(|a, b| a.tl.y == b.tl.y)
            .collect();
        if !top_to_bottom {
            bands.reverse();
        }
        let mut out = Vec::with_capacity(self.rects.len());
        for band in bands {
            if left_to_right {
                out.extend_from_slice(band);
            } else {
                out.extend(band.iter().rev());
            }
        }
        out
    }
}

// Spans of the band that contains `y`. `cursor` only moves forward since
// callers walk the bands top to bottom.
fn band_spans(region: &Region, cursor: &mut usize, y: i32) -> Vec<Span> {
    let rects = &region.rects;
    while *cursor < rects.len() && rects[*cursor].br.y <= y {
        *cursor += 1;
    }
    rects[*cursor..]
        .iter()
        .take_while(|r| r.tl.y <= y)
        .map(|r| (r.tl.x, r.br.x))
        .collect()
}

fn merge_spans(a: &[Span], b: &[Span], op: Op) -> Vec<Span> {
    let mut xs: Vec<i32> = a
        .iter()
        .chain(b.iter())
        .flat_map(|&(x1, x2)| [x1, x2])
        .collect();
    xs.sort_unstable();
    xs.dedup();

    let mut out: Vec<Span> = Vec::new();
    let (mut i, mut j) = (0, 0);
    for seg in xs.windows(2) {
        let x = seg[0];
        while i < a.len() && a[i].1 <= x {
            i += 1;
        }
        while j < b.len() && b[j].1 <= x {
            j += 1;
        }
        let in_a = i < a.len() && a[i].0 <= x;
        let in_b = j < b.len() && b[j].0 <= x;
        if op.apply(in_a, in_b) {
            match out.last_mut() {
                Some(last) if last.1 == x => last.1 = seg[1],
                _ => out.push((x, seg[1])),
            }
        }
    }
    out
}

fn combine(a: &Region, b: &Region, op: Op) -> Region {
    let mut ys: Vec<i32> = a
        .rects
        .iter()
        .chain(b.rects.iter())
        .flat_map(|r| [r.tl.y, r.br.y])
        .collect();
    ys.sort_unstable();
    ys.dedup();

    let mut out = Vec::new();
    let mut last_band = 0;
    let (mut ca, mut cb) = (0, 0);

    for band in ys.windows(2) {
        let (y1, y2) = (band[0], band[1]);
        let spans = merge_spans(
            &band_spans(a, &mut ca, y1),
            &band_spans(b, &mut cb, y1),
            op,
        );
        if spans.is_empty() {
            continue;
        }

        let prev: &mut [Rect] = &mut out[last_band..];
        let coalesce = !prev.is_empty()
            && prev[0].br.y == y1
            && prev.len() == spans.len()
            && prev
                .iter()
                .zip(spans.iter())
                .all(|(r, s)| r.tl.x == s.0 && r.br.x == s.1);

        if coalesce {
            for r in prev.iter_mut() {
                r.br.y = y2;
            }
        } else {
            last_band = out.len();
            out.extend(spans.into_iter().map(|(x1, x2)| Rect::new(x1, y1, x2, y2)));
        }
    }

    Region { rects: out }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: i32 = 48;
    const H: i32 = 40;

    struct XorShift(u32);

    impl XorShift {
        fn next(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            x
        }

        fn range(&mut self, lo: i32, hi: i32) -> i32 {
            lo + (self.next() % (hi - lo) as u32) as i32
        }

        fn rect(&mut self) -> Rect {
            let x = self.range(-4, W);
            let y = self.range(-4, H);
            Rect::from_xywh(x, y, self.range(0, 20), self.range(0, 20))
                .intersect(&Rect::new(-4, -4, W + 4, H + 4))
        }
    }

    fn raster(region: &Region) -> Vec<bool> {
        let mut bits = vec![false; ((W + 8) * (H + 8)) as usize];
        for r in region.rects() {
            for y in r.tl.y..r.br.y {
                for x in r.tl.x..r.br.x {
                    bits[((y + 4) * (W + 8) + x + 4) as usize] = true;
                }
            }
        }
        bits
    }

    fn assert_disjoint(region: &Region) {
        let rects = region.rects();
        for (i, a) in rects.iter().enumerate() {
            assert!(!a.is_empty());
            for b in &rects[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn rect_basics() {
        let a = Rect::from_xywh(0, 0, 10, 10);
        let b = Rect::from_xywh(5, 5, 10, 10);
        assert_eq!(a.intersect(&b), Rect::new(5, 5, 10, 10));
        assert!(a.intersect(&Rect::from_xywh(10, 0, 5, 5)).is_empty());
        assert!(Rect::new(1, 1, 9, 9).enclosed_by(&a));
        assert_eq!(a.union_boundary(&b), Rect::new(0, 0, 15, 15));
    }

    #[test]
    fn union_of_adjacent_rects_coalesces() {
        let mut r = Region::from(Rect::from_xywh(0, 0, 10, 10));
        r.assign_union(&Region::from(Rect::from_xywh(10, 0, 10, 10)));
        r.assign_union(&Region::from(Rect::from_xywh(0, 10, 20, 5)));
        assert_eq!(r.rects(), &[Rect::new(0, 0, 20, 15)]);
    }

    #[test]
    fn subtract_punches_hole() {
        let r = Region::from(Rect::from_xywh(0, 0, 30, 30))
            .subtract(&Region::from(Rect::from_xywh(10, 10, 10, 10)));
        assert_eq!(r.area(), 900 - 100);
        assert_eq!(r.num_rects(), 4);
        assert!(!r.contains(Point::new(15, 15)));
        assert!(r.contains(Point::new(5, 15)));
        assert_disjoint(&r);
    }

    #[test]
    fn equal_coverage_is_equal_region() {
        let a: Region = [Rect::from_xywh(0, 0, 4, 8), Rect::from_xywh(4, 0, 4, 8)]
            .into_iter()
            .collect();
        let b: Region = [Rect::from_xywh(0, 0, 8, 3), Rect::from_xywh(0, 3, 8, 5)]
            .into_iter()
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn translate_moves_everything() {
        let mut r = Region::from(Rect::from_xywh(0, 0, 4, 4));
        r.translate(Point::new(3, -2));
        assert_eq!(r.bounding_rect(), Rect::new(3, -2, 7, 2));
    }

    #[test]
    fn random_sequences_match_bitmap() {
        let mut rng = XorShift(0x1234_5678);
        for _ in 0..200 {
            let mut region = Region::new();
            let mut bits = raster(&region);
            for _ in 0..12 {
                let operand: Region = (0..rng.range(1, 4)).map(|_| rng.rect()).collect();
                let other = raster(&operand);
                match rng.next() % 3 {
                    0 => {
                        region.assign_union(&operand);
                        bits.iter_mut().zip(other).for_each(|(a, b)| *a = *a || b);
                    }
                    1 => {
                        region.assign_subtract(&operand);
                        bits.iter_mut().zip(other).for_each(|(a, b)| *a = *a && !b);
                    }
                    _ => {
                        region.assign_intersect(&operand);
                        bits.iter_mut().zip(other).for_each(|(a, b)| *a = *a && b);
                    }
                }
                assert_disjoint(&region);
                assert_eq!(raster(&region), bits);
            }
        }
    }

    #[test]
    fn ordered_walk_keeps_bands() {
        let region: Region = [
            Rect::from_xywh(0, 0, 2, 2),
            Rect::from_xywh(4, 0, 2, 2),
            Rect::from_xywh(0, 5, 2, 2),
        ]
        .into_iter()
        .collect();
        let ordered = region.rects_ordered(false, false);
        assert_eq!(
            ordered,
            vec![
                Rect::from_xywh(0, 5, 2, 2),
                Rect::from_xywh(4, 0, 2, 2),
                Rect::from_xywh(0, 0, 2, 2),
            ]
        );
        assert_eq!(region.rects_ordered(true, true), region.rects().to_vec());
    }
}
