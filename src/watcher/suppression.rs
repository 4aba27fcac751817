/// Short-lived markers for paths the worker itself just wrote
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Recently written paths, each expiring after `window`.
///
/// A marker on a directory also covers everything below it, so a folder
/// move suppresses notifications for the files inside.
#[derive(Debug)]
pub struct RecentWrites {
    window: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl RecentWrites {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn mark(&self, path: &str) {
        self.mark_all(std::iter::once(path));
    }

    pub fn mark_all<'a, I>(&self, paths: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires| *expires > now);
        for path in paths {
            entries.insert(path.trim_end_matches('/').to_string(), now + self.window);
        }
    }

    /// Whether `path` or one of its ancestors carries a live marker
    pub fn is_recent(&self, path: &str) -> bool {
        self.is_recent_at(path, Instant::now())
    }

    fn is_recent_at(&self, path: &str, now: Instant) -> bool {
        let entries = self.entries.lock();
        let live = |candidate: &str| matches!(entries.get(candidate), Some(expires) if *expires > now);

        let mut candidate = path.trim_end_matches('/');
        loop {
            if live(candidate) {
                return true;
            }
            match candidate.rfind('/') {
                Some(idx) => candidate = &candidate[..idx],
                None => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_expires_after_window() {
        let recent = RecentWrites::new(Duration::from_secs(1));
        recent.mark("a.md");

        assert!(recent.is_recent("a.md"));
        assert!(!recent.is_recent("b.md"));
        assert!(!recent.is_recent_at("a.md", Instant::now() + Duration::from_secs(2)));
    }

    #[test]
    fn test_directory_marker_covers_children() {
        let recent = RecentWrites::new(Duration::from_secs(1));
        recent.mark("archive/notes");

        assert!(recent.is_recent("archive/notes/x.md"));
        assert!(recent.is_recent("archive/notes"));
        assert!(!recent.is_recent("archive/notes-old/x.md"));
        assert!(!recent.is_recent("archive"));
    }

    #[test]
    fn test_expired_markers_are_pruned_on_mark() {
        let recent = RecentWrites::new(Duration::ZERO);
        recent.mark("a.md");
        recent.mark("b.md");
        assert_eq!(recent.len(), 1);
    }
}
