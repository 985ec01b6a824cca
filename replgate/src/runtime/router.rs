//! Depth-tracked capture of code-unit output.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("leave() called at depth 0")]
    Underflow,
    #[error("expected depth 0, router is at depth {0}")]
    NotAtRoot(usize),
}

/// One output buffer per active depth.
///
/// Writes always land in the innermost buffer, so text written by a nested
/// delegate call never reaches an enclosing depth.
#[derive(Debug, Clone)]
pub struct OutputRouter {
    buffers: Vec<String>,
}

impl Default for OutputRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputRouter {
    pub fn new() -> Self {
        Self {
            buffers: vec![String::new()],
        }
    }

    pub fn depth(&self) -> usize {
        self.buffers.len() - 1
    }

    pub fn write(&mut self, text: &str) {
        if let Some(buffer) = self.buffers.last_mut() {
            buffer.push_str(text);
        }
    }

    /// Push a fresh buffer; returns the new depth.
    pub fn enter(&mut self) -> usize {
        self.buffers.push(String::new());
        self.depth()
    }

    /// Pop the innermost buffer and return its text.
    pub fn leave(&mut self) -> Result<String, RouterError> {
        if self.buffers.len() <= 1 {
            return Err(RouterError::Underflow);
        }
        self.buffers.pop().ok_or(RouterError::Underflow)
    }

    /// Text captured at the current depth.
    pub fn current(&self) -> &str {
        self.buffers.last().map(String::as_str).unwrap_or_default()
    }

    /// Take the depth-0 buffer, leaving it empty.
    pub fn take_root(&mut self) -> Result<String, RouterError> {
        if self.depth() != 0 {
            return Err(RouterError::NotAtRoot(self.depth()));
        }
        Ok(std::mem::take(&mut self.buffers[0]))
    }

    /// Drop every nested buffer and clear depth 0.
    pub fn reset(&mut self) {
        self.buffers.truncate(1);
        self.buffers[0].clear();
    }
}
