//! Multi-phase load completion: fragment-list streaming, geometry/material
//! streaming and the spatial index build each signal done once; reaching the
//! fixed target raises the terminal completion exactly once.

use std::sync::mpsc::Sender;
use std::time::Instant;

use log::{info, warn};

use crate::model::{LoadPhase, LoaderEvent};

/// All three phases must report in. Compared for exact equality, so the
/// finalization is only reachable once.
const PHASE_TARGET: u8 = 3;

pub struct CompletionTracker {
    fragment_list_done: bool,
    streaming_done: bool,
    index_done: bool,
    phases_done: u8,
    complete: bool,
    last_percent: Option<u32>,
    started: Instant,
    events: Sender<LoaderEvent>,
}

impl CompletionTracker {
    pub fn new(events: Sender<LoaderEvent>) -> Self {
        Self {
            fragment_list_done: false,
            streaming_done: false,
            index_done: false,
            phases_done: 0,
            complete: false,
            last_percent: None,
            started: Instant::now(),
            events,
        }
    }

    pub fn is_phase_done(&self, phase: LoadPhase) -> bool {
        match phase {
            LoadPhase::FragmentList => self.fragment_list_done,
            LoadPhase::Streaming => self.streaming_done,
            LoadPhase::SpatialIndex => self.index_done,
        }
    }

    /// Marks one phase finished. Returns true when this call completed the
    /// whole load. A duplicate report for the same phase is ignored with a
    /// diagnostic, so the counter strictly increases.
    pub fn phase_done(&mut self, phase: LoadPhase) -> bool {
        let flag = match phase {
            LoadPhase::FragmentList => &mut self.fragment_list_done,
            LoadPhase::Streaming => &mut self.streaming_done,
            LoadPhase::SpatialIndex => &mut self.index_done,
        };
        if *flag {
            warn!("phase {:?} reported done twice, ignoring", phase);
            return false;
        }
        *flag = true;
        self.phases_done += 1;

        if self.phases_done == PHASE_TARGET {
            self.finalize();
            return true;
        }
        false
    }

    fn finalize(&mut self) {
        debug_assert!(!self.complete);
        self.complete = true;
        info!("geometry load done after {}ms", self.started.elapsed().as_millis());
        let _ = self.events.send(LoaderEvent::LoadComplete);
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Emits a streaming progress event, but only when the integer percent
    /// value changed, to bound event volume on large models.
    pub fn update_streaming_progress(&mut self, resolved: usize, total: usize) {
        let percent = if total == 0 {
            100
        } else {
            (100 * resolved / total) as u32
        };
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            let _ = self.events.send(LoaderEvent::Progress {
                percent,
                phase: LoadPhase::Streaming,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn completes_exactly_once_after_all_three_phases() {
        let (tx, rx) = channel();
        let mut tracker = CompletionTracker::new(tx);

        assert!(!tracker.phase_done(LoadPhase::FragmentList));
        assert!(!tracker.phase_done(LoadPhase::SpatialIndex));
        assert!(!tracker.is_complete());
        assert!(tracker.phase_done(LoadPhase::Streaming));
        assert!(tracker.is_complete());

        let completions = rx
            .try_iter()
            .filter(|e| matches!(e, LoaderEvent::LoadComplete))
            .count();
        assert_eq!(1, completions);
    }

    #[test]
    fn duplicate_phase_reports_are_ignored() {
        let (tx, rx) = channel();
        let mut tracker = CompletionTracker::new(tx);

        assert!(!tracker.phase_done(LoadPhase::FragmentList));
        assert!(!tracker.phase_done(LoadPhase::FragmentList));
        assert!(!tracker.phase_done(LoadPhase::Streaming));
        // Without the per-phase guard this third call would already finalize.
        assert!(!tracker.phase_done(LoadPhase::Streaming));
        assert!(!tracker.is_complete());

        assert!(tracker.phase_done(LoadPhase::SpatialIndex));
        assert_eq!(
            1,
            rx.try_iter().filter(|e| matches!(e, LoaderEvent::LoadComplete)).count()
        );
    }

    #[test]
    fn progress_only_fires_on_integer_percent_change() {
        let (tx, rx) = channel();
        let mut tracker = CompletionTracker::new(tx);

        // 1000 fragments: the first 9 resolutions stay at 0 percent.
        for resolved in 0..=9 {
            tracker.update_streaming_progress(resolved, 1000);
        }
        tracker.update_streaming_progress(10, 1000);
        tracker.update_streaming_progress(500, 1000);
        tracker.update_streaming_progress(1000, 1000);

        let percents: Vec<u32> = rx
            .try_iter()
            .filter_map(|e| match e {
                LoaderEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert_eq!(vec![0, 1, 50, 100], percents);
    }

    #[test]
    fn empty_model_reports_hundred_percent() {
        let (tx, rx) = channel();
        let mut tracker = CompletionTracker::new(tx);
        tracker.update_streaming_progress(0, 0);

        assert!(matches!(
            rx.try_recv().unwrap(),
            LoaderEvent::Progress { percent: 100, .. }
        ));
    }
}
