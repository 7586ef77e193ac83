use crate::region::{Point, Region};

/// What an update should carry for a given clip region
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    pub changed: Region,
    pub copied: Region,
    pub copy_delta: Point,
}

impl UpdateInfo {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.copied.is_empty()
    }

    pub fn num_rects(&self) -> usize {
        self.changed.num_rects() + self.copied.num_rects()
    }
}

/// Accumulates damage between two updates
///
/// Only one copy delta can be tracked at a time. Copies that cannot be
/// merged into the tracked one degrade into plain changes.
#[derive(Debug, Clone)]
pub struct UpdateTracker {
    changed: Region,
    copied: Region,
    copy_delta: Point,
    copy_enabled: bool,
}

impl Default for UpdateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateTracker {
    pub fn new() -> Self {
        Self {
            changed: Region::new(),
            copied: Region::new(),
            copy_delta: Point::default(),
            copy_enabled: true,
        }
    }

    /// Turning copies off folds everything pending into `changed`
    pub fn enable_copyrect(&mut self, enable: bool) {
        if !enable && self.copy_enabled {
            let copied = std::mem::take(&mut self.copied);
            self.add_changed(&copied);
        }
        self.copy_enabled = enable;
    }

    pub fn add_changed(&mut self, region: &Region) {
        self.changed.assign_union(region);
    }

    /// `dest` now shows what was at `dest - delta`
    pub fn add_copied(&mut self, dest: &Region, delta: Point) {
        if !self.copy_enabled {
            self.add_changed(dest);
            return;
        }
        if dest.is_empty() {
            return;
        }

        let src = dest.translated(delta.negate());
        let mut overlap = src.intersect(&self.copied);

        if overlap.is_empty() {
            let new_br = dest.bounding_rect();
            let old_br = self.copied.bounding_rect();
            if old_br.area() > new_br.area() {
                // keep the bigger copy, the new one becomes a change
                self.changed.assign_union(dest);
            } else {
                // pixels still waiting to be sent must not be copied around
                let invalid_src = src.intersect(&self.changed).translated(delta);
                self.changed.assign_union(&invalid_src);
                let old_copied = std::mem::take(&mut self.copied);
                self.changed.assign_union(&old_copied);
                self.copied = dest.clone();
                self.copy_delta = delta;
            }
            return;
        }

        // the new copy continues the tracked one
        let invalid_src = overlap.intersect(&self.changed).translated(delta);
        self.changed.assign_union(&invalid_src);

        overlap.translate(delta);
        let nonoverlapped = dest.union(&self.copied).subtract(&overlap);
        self.changed.assign_union(&nonoverlapped);

        self.copied = overlap;
        self.copy_delta = self.copy_delta.translate(delta);
    }

    /// Drop damage that has been queued for sending
    pub fn subtract(&mut self, region: &Region) {
        self.copied.assign_subtract(region);
        self.changed.assign_subtract(region);
    }

    pub fn clear(&mut self) {
        self.changed.clear();
        self.copied.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.copied.is_empty()
    }

    /// Normalize and clip the pending damage
    ///
    /// Copies that overlap a pending change lose against it, so the
    /// returned `changed` and `copied` never intersect.
    pub fn get_update_info(&mut self, clip: &Region) -> UpdateInfo {
        self.copied.assign_subtract(&self.changed);
        UpdateInfo {
            changed: self.changed.intersect(clip),
            copied: self.copied.intersect(clip),
            copy_delta: self.copy_delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Rect;

    fn region(x: i32, y: i32, w: i32, h: i32) -> Region {
        Rect::from_xywh(x, y, w, h).into()
    }

    #[test]
    fn changes_win_over_copies() {
        let mut tracker = UpdateTracker::new();
        tracker.add_copied(&region(0, 10, 50, 10), Point::new(0, 10));
        tracker.add_changed(&region(10, 10, 10, 10));
        let clip = region(0, 0, 100, 100);
        let info = tracker.get_update_info(&clip);
        assert!(info.changed.intersect(&info.copied).is_empty());
        assert_eq!(info.copied.area(), 400);
        assert_eq!(info.copy_delta, Point::new(0, 10));
    }

    #[test]
    fn damaged_source_is_resent() {
        let mut tracker = UpdateTracker::new();
        tracker.add_changed(&region(0, 0, 10, 10));
        tracker.add_copied(&region(0, 20, 10, 10), Point::new(0, 20));
        let info = tracker.get_update_info(&region(0, 0, 100, 100));
        // the copy destination carried stale pixels
        assert!(info.copied.is_empty());
        assert_eq!(info.changed, region(0, 0, 10, 10).union(&region(0, 20, 10, 10)));
    }

    #[test]
    fn continued_scroll_accumulates_delta() {
        let mut tracker = UpdateTracker::new();
        tracker.add_copied(&region(0, 10, 100, 90), Point::new(0, 10));
        tracker.add_copied(&region(0, 20, 100, 80), Point::new(0, 10));
        let info = tracker.get_update_info(&region(0, 0, 100, 100));
        assert_eq!(info.copy_delta, Point::new(0, 20));
        assert_eq!(info.copied, region(0, 20, 100, 80));
        assert_eq!(info.changed, region(0, 10, 100, 10));
    }

    #[test]
    fn disabled_copyrect_degrades() {
        let mut tracker = UpdateTracker::new();
        tracker.add_copied(&region(0, 0, 10, 10), Point::new(5, 0));
        tracker.enable_copyrect(false);
        let info = tracker.get_update_info(&region(0, 0, 100, 100));
        assert!(info.copied.is_empty());
        assert_eq!(info.changed.area(), 100);

        tracker.add_copied(&region(50, 50, 10, 10), Point::new(1, 1));
        let info = tracker.get_update_info(&region(0, 0, 100, 100));
        assert!(info.copied.is_empty());
        assert_eq!(info.changed.area(), 200);
    }

    #[test]
    fn subtract_only_removes_sent_area() {
        let mut tracker = UpdateTracker::new();
        tracker.add_changed(&region(0, 0, 20, 20));
        tracker.subtract(&region(0, 0, 10, 20));
        let info = tracker.get_update_info(&region(0, 0, 100, 100));
        assert_eq!(info.changed, region(10, 0, 10, 20));
        // nothing outside the clip leaks out
        let info = tracker.get_update_info(&region(0, 0, 5, 5));
        assert!(info.is_empty());
        assert!(!tracker.is_empty());
    }

    #[test]
    fn random_damage_stays_disjoint() {
        let mut seed = 0x9e37_79b9_u32;
        let mut next = move |lo: i32, hi: i32| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            lo + (seed % (hi - lo) as u32) as i32
        };
        let clip = region(0, 0, 64, 64);
        for _ in 0..100 {
            let mut tracker = UpdateTracker::new();
            for _ in 0..10 {
                let r = region(next(0, 60), next(0, 60), next(1, 30), next(1, 30));
                match next(0, 3) {
                    0 => tracker.add_changed(&r),
                    1 => tracker.add_copied(&r, Point::new(next(-8, 8), next(-8, 8))),
                    _ => tracker.subtract(&r),
                }
                let info = tracker.get_update_info(&clip);
                assert!(info.changed.intersect(&info.copied).is_empty());
            }
        }
    }
}
