//! Incremental byte-pattern matcher
//!
//! Fed one byte at a time, reports when the pattern has just been completed.
//! Uses a KMP failure table so a partial match that breaks off part-way
//! (e.g. `aab` inside `aaab`) falls back to the longest viable prefix
//! instead of restarting from zero.

/// Matcher for a single byte pattern
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: Vec<u8>,
    failure: Vec<usize>,
    matched: usize,
}

impl PatternMatcher {
    pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
        let pattern = pattern.into();
        let failure = failure_table(&pattern);
        Self {
            pattern,
            failure,
            matched: 0,
        }
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// Forget any partial match
    pub fn reset(&mut self) {
        self.matched = 0;
    }

    /// Feed the next byte; returns true when the pattern ends at this byte
    pub fn check(&mut self, byte: u8) -> bool {
        if self.pattern.is_empty() {
            return false;
        }
        while self.matched > 0 && self.pattern[self.matched] != byte {
            self.matched = self.failure[self.matched - 1];
        }
        if self.pattern[self.matched] == byte {
            self.matched += 1;
        }
        if self.matched == self.pattern.len() {
            self.matched = 0;
            return true;
        }
        false
    }
}

/// `failure[i]` = length of the longest proper prefix of `pattern[..=i]`
/// that is also a suffix of it
fn failure_table(pattern: &[u8]) -> Vec<usize> {
    let mut failure = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = failure[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        failure[i] = k;
    }
    failure
}
