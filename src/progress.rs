/// Progress sink for long-running operations: `(percent, stage label)`.
///
/// Called from the thread that drives the operation, between work units, with
/// a non-decreasing percentage inside one stage.
pub trait Progress {
    fn report(&mut self, percent: u32, stage: &str);
}

impl<F: FnMut(u32, &str)> Progress for F {
    fn report(&mut self, percent: u32, stage: &str) {
        self(percent, stage)
    }
}

/// Turns `done / total` counts into de-duplicated percentage updates.
pub(crate) struct Ticker<'a> {
    sink: &'a mut dyn Progress,
    stage: &'static str,
    total: usize,
    last: Option<u32>,
}

impl<'a> Ticker<'a> {
    pub(crate) fn new(sink: &'a mut dyn Progress, stage: &'static str, total: usize) -> Self {
        Self {
            sink,
            stage,
            total,
            last: None,
        }
    }

    pub(crate) fn tick(&mut self, done: usize) {
        let percent = if self.total == 0 {
            100
        } else {
            (done.min(self.total) * 100 / self.total) as u32
        };
        if self.last.map_or(true, |l| percent > l) {
            self.last = Some(percent);
            self.sink.report(percent, self.stage);
        }
    }
}
