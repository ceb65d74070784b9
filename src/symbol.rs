//! Symbol normalisation (spec §6.6).
//!
//! Accepts loose user input (`DOGEUSD`, `DOGE/USD`, `doge-usd`) and produces
//! canonical `wsPair` (slashed, e.g. `DOGE/USD`) and `restPair` (flat, e.g.
//! `DOGEUSD`) forms.

const QUOTE_SUFFIXES: &[&str] = &[
    "USDT", "USDC", "DAI", "USD", "EUR", "GBP", "CAD", "CHF", "JPY", "AUD", "NZD", "BTC", "XBT",
    "ETH", "SOL", "DOT", "ADA", "TRY", "MXN", "ZUSD", "ZEUR", "ZGBP", "ZCAD", "ZJPY", "ZAUD",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSymbol {
    pub base: String,
    pub quote: String,
}

impl CanonicalSymbol {
    pub fn ws_pair(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }

    pub fn rest_pair(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

/// Canonicalise a loosely-formatted pair string.
///
/// `canonicalize(canonicalize(x).rest_pair()) == canonicalize(x)` for all
/// valid inputs — i.e. re-running the normaliser on its own flat output is a
/// no-op.
pub fn canonicalize(input: &str) -> Option<CanonicalSymbol> {
    let upper = input.to_uppercase();
    let collapsed = collapse_separators(&upper);

    if let Some((base, quote)) = collapsed.split_once('/') {
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        return Some(CanonicalSymbol {
            base: base.to_string(),
            quote: quote.to_string(),
        });
    }

    split_at_longest_known_quote(&collapsed)
}

/// Uppercase and fold `:`, `-`, ` ` into `/`, collapsing repeats of the
/// separator so `"DOGE--USD"` and `"DOGE - USD"` both become `"DOGE/USD"`.
fn collapse_separators(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_sep = false;
    for ch in s.chars() {
        let is_sep = matches!(ch, ':' | '-' | ' ' | '/');
        if is_sep {
            if !last_was_sep {
                out.push('/');
            }
            last_was_sep = true;
        } else {
            out.push(ch);
            last_was_sep = false;
        }
    }
    out.trim_matches('/').to_string()
}

fn split_at_longest_known_quote(flat: &str) -> Option<CanonicalSymbol> {
    let mut best: Option<(&str, &str)> = None;
    for &suffix in QUOTE_SUFFIXES {
        if let Some(base) = flat.strip_suffix(suffix) {
            if base.is_empty() {
                continue;
            }
            if best.map_or(true, |(_, q)| suffix.len() > q.len()) {
                best = Some((base, suffix));
            }
        }
    }
    best.map(|(base, quote)| CanonicalSymbol {
        base: base.to_string(),
        quote: quote.to_string(),
    })
}
