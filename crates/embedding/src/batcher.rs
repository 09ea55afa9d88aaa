//! Token estimation, truncation, and batch budgeting.
//!
//! Batches are bounded by item count and estimated input tokens; a single
//! oversized item is truncated to the model limit at a line boundary.

use std::time::Duration;

/// Characters per token estimate.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone)]
pub struct BatchLimits {
  /// Maximum items per request.
  pub max_items: usize,
  /// Maximum estimated input tokens per request.
  pub max_tokens: usize,
  /// Maximum estimated tokens for a single item; longer items are truncated.
  pub max_item_tokens: usize,
  /// How long an under-filled batch may wait for more work.
  pub linger: Duration,
}

impl Default for BatchLimits {
  fn default() -> Self {
    Self {
      max_items: 2048,
      max_tokens: 400_000,
      max_item_tokens: 8192,
      linger: Duration::from_millis(200),
    }
  }
}

pub fn estimate_tokens(text: &str) -> usize {
  text.len() / CHARS_PER_TOKEN
}

/// Truncate `text` so its estimate fits `max_tokens`, cutting at the last
/// line boundary inside the budget. Text without a usable newline falls back
/// to a character-boundary cut.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
  if estimate_tokens(text) <= max_tokens {
    return text;
  }
  let budget = max_tokens * CHARS_PER_TOKEN;
  match text.as_bytes()[..budget].iter().rposition(|&b| b == b'\n') {
    Some(pos) => &text[..=pos],
    None => {
      let mut cut = budget;
      while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
      }
      &text[..cut]
    }
  }
}
