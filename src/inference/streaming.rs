//! Streaming inference support
//!
//! Turns the per-token byte pieces produced by the model into text fragments
//! and keeps the rolling tokens-per-second statistic reported with each
//! `update` event.

use std::time::Instant;

/// Assembles token bytes into complete UTF-8 fragments.
///
/// A multi-byte character can be split across tokens, so a token may yield
/// no text at all; its bytes are held until the character completes.
#[derive(Debug, Default)]
pub struct TextStreamer {
    pending: Vec<u8>,
    output: String,
}

impl TextStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the bytes of one token; returns the text that became complete.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let mut fragment = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    fragment.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to guarantees this prefix decodes
                    fragment.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            fragment.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // incomplete sequence at the end, wait for more bytes
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        self.emit(fragment)
    }

    /// Flush whatever is still buffered at the end of generation.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let fragment = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        self.emit(fragment)
    }

    /// Everything emitted so far
    pub fn output(&self) -> &str {
        &self.output
    }

    fn emit(&mut self, fragment: String) -> Option<String> {
        if fragment.is_empty() {
            return None;
        }
        self.output.push_str(&fragment);
        Some(fragment)
    }
}

/// Rolling generation speed, measured from the first emitted token.
#[derive(Debug, Default)]
pub struct TokenRate {
    started: Option<Instant>,
    count: usize,
    tps: Option<f64>,
}

impl TokenRate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one decoded token.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    fn tick_at(&mut self, now: Instant) {
        let started = *self.started.get_or_insert(now);
        self.count += 1;
        if self.count > 1 {
            let secs = now.duration_since(started).as_secs_f64();
            if secs > 0.0 {
                self.tps = Some(self.count as f64 / secs);
            }
        }
    }

    /// Tokens decoded so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Tokens per second; unknown until the second token
    pub fn tokens_per_second(&self) -> Option<f64> {
        self.tps
    }
}
