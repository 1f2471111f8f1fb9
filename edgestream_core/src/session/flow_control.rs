#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    PauseReads,
    ResumeReads,
}

/// Hysteresis over the outbound queue free count. Each crossing yields
/// exactly one signal.
#[derive(Debug)]
pub struct FlowControl {
    low_water_mark: usize,
    high_water_mark: usize,
    paused: bool,
}

impl FlowControl {
    pub fn new(capacity: usize, low_water_mark: usize, resume_margin: usize) -> Self {
        Self {
            low_water_mark,
            high_water_mark: capacity.saturating_sub(resume_margin),
            paused: false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn observe(&mut self, free_count: usize) -> Option<FlowSignal> {
        if !self.paused && free_count < self.low_water_mark {
            self.paused = true;
            Some(FlowSignal::PauseReads)
        } else if self.paused && free_count > self.high_water_mark {
            self.paused = false;
            Some(FlowSignal::ResumeReads)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_and_resume_once() {
        let mut flow = FlowControl::new(16, 3, 5);
        let mut signals = Vec::new();
        for free in (0..=16).rev().chain(0..=16) {
            if let Some(s) = flow.observe(free) {
                signals.push((free, s));
            }
        }
        assert_eq!(
            signals,
            vec![(2, FlowSignal::PauseReads), (12, FlowSignal::ResumeReads)]
        );
        assert!(!flow.is_paused());
    }

    #[test]
    fn test_no_resume_inside_band() {
        let mut flow = FlowControl::new(4096, 3, 5);
        assert_eq!(flow.observe(3), None);
        assert_eq!(flow.observe(2), Some(FlowSignal::PauseReads));
        assert_eq!(flow.observe(1), None);
        assert_eq!(flow.observe(4091), None);
        assert_eq!(flow.observe(4092), Some(FlowSignal::ResumeReads));
    }
}
