//! Token usage accounting.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token usage for one LLM step or an entire run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the request.
    pub input_tokens: u64,
    /// Tokens produced by the response.
    pub output_tokens: u64,
}

impl Usage {
    /// Usage with both counters at zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Create a usage record.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens across input and output.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_has_no_tokens() {
        assert_eq!(Usage::zero().total(), 0);
    }

    #[test]
    fn add_accumulates() {
        let mut usage = Usage::new(10, 5);
        usage += Usage::new(3, 2);
        assert_eq!(usage, Usage::new(13, 7));
        assert_eq!(usage.total(), 20);
    }

    #[test]
    fn serde_roundtrip() {
        let usage = Usage::new(100, 42);
        let json = serde_json::to_string(&usage).unwrap();
        let parsed: Usage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, usage);
    }
}
