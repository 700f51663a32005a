//! decision.rs: trading decision parsed from a classification response.
//!
//! The model is asked to answer in the shape `rationale---ticker---code`.
//! `extract` turns any string into a decision; it never fails. Malformed
//! answers degrade to `NoSignal` and keep the raw text as the rationale.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Separator between the three answer segments.
pub const SEGMENT_DELIMITER: &str = "---";

/// Ticker used when the model names none.
pub const NO_TICKER: &str = "NONE";

/// What the pipeline should do with a classified item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    NoSignal,
    Buy,
    Sell,
}

impl Decision {
    /// Wire name used in the derived stream (`buy` / `sell` / `no_signal`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::NoSignal => "no_signal",
            Decision::Buy => "buy",
            Decision::Sell => "sell",
        }
    }

    /// Only buy/sell decisions produce a signal event.
    pub fn is_signal(&self) -> bool {
        !matches!(self, Decision::NoSignal)
    }

    fn from_code(code: char) -> Self {
        match code {
            '1' => Decision::Buy,
            '2' => Decision::Sell,
            _ => Decision::NoSignal,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed classification: decision, normalized ticker and free-text rationale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub decision: Decision,
    pub ticker: String,
    pub rationale: String,
}

impl Extraction {
    /// `NoSignal` carrying the given rationale and no ticker.
    pub fn no_signal(rationale: impl Into<String>) -> Self {
        Self {
            decision: Decision::NoSignal,
            ticker: NO_TICKER.to_string(),
            rationale: rationale.into(),
        }
    }
}

/// Parse a classification response. Total over all inputs.
pub fn extract(response: &str) -> Extraction {
    if response.is_empty() {
        return Extraction::no_signal("");
    }

    let segments: Vec<&str> = response.split(SEGMENT_DELIMITER).collect();
    let [rationale, ticker, code] = segments.as_slice() else {
        warn!(
            segments = segments.len(),
            response, "malformed classification response, expected 3 segments"
        );
        return Extraction::no_signal(response);
    };

    let decision = match final_code_char(code) {
        Some(c) => Decision::from_code(c),
        None => {
            warn!(code = *code, "empty decision code");
            Decision::NoSignal
        }
    };

    Extraction {
        decision,
        ticker: normalize_ticker(ticker),
        rationale: rationale.trim().to_string(),
    }
}

/// Upper-cased ticker; blank or "none" in any case collapses to `NONE`.
pub fn normalize_ticker(raw: &str) -> String {
    let ticker = raw.trim().to_uppercase();
    if ticker.is_empty() || ticker == NO_TICKER {
        NO_TICKER.to_string()
    } else {
        ticker
    }
}

// Last significant character of the code segment; trailing whitespace and
// punctuation ("1.", "2 !") are ignored.
fn final_code_char(code: &str) -> Option<char> {
    code.trim_end_matches(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .chars()
        .next_back()
}
