use parking_lot::Mutex;

pub fn now_micros() -> i64 {
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_micros() as i64
}

/// Process-wide monotonic id source. Ids are derived from the microsecond
/// clock but never repeat or go backwards, even when allocations outpace the
/// clock resolution; the mutex keeps concurrent allocations from colliding.
#[derive(Debug)]
pub struct SafeIdGenerator {
    last: Mutex<u64>,
}

impl SafeIdGenerator {
    pub fn new() -> Self {
        Self { last: Mutex::new(0) }
    }

    pub fn next(&self) -> u64 {
        let mut last = self.last.lock();
        let now = now_micros() as u64;
        *last = now.max(*last + 1);
        *last
    }

    pub fn next_batch(&self, n: usize) -> Vec<u64> {
        let mut last = self.last.lock();
        let now = now_micros() as u64;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            *last = now.max(*last + 1);
            out.push(*last);
        }
        out
    }
}

impl Default for SafeIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
