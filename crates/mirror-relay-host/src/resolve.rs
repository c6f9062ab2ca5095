//! Click locator strategies.
//!
//! A click from a mirrored copy can be mapped back onto the host in several
//! ways. Each strategy looks at the request alone and either produces a
//! locator or declines; the dispatcher tries them in [`STRATEGIES`] order
//! and stops at the first one the host accepts.

use serde::Serialize;

use mirror_relay_core::command::ClickRequest;

/// How the host-side click script finds its element.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Locator {
    /// The identifier tagged onto the element at capture time.
    Structural { relay_id: String },
    /// A point inside the visible scroll viewport, as fractions of its
    /// size, after scrolling to `scroll_percent` when given.
    Point {
        x_ratio: f64,
        y_ratio: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        scroll_percent: Option<f64>,
    },
    /// The `index`-th element whose trimmed text equals `text`.
    Text {
        selector: Option<String>,
        text: String,
        index: usize,
    },
}

pub type Strategy = fn(&ClickRequest) -> Option<Locator>;

/// Most to least precise.
pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("structural", structural),
    ("coordinates", coordinates),
    ("text_match", text_match),
];

pub fn structural(req: &ClickRequest) -> Option<Locator> {
    let relay_id = req.relay_id.as_deref()?.trim();
    if relay_id.is_empty() {
        return None;
    }
    Some(Locator::Structural {
        relay_id: relay_id.to_string(),
    })
}

pub fn coordinates(req: &ClickRequest) -> Option<Locator> {
    let (x, y) = (req.x_ratio?, req.y_ratio?);
    let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
    if !in_range(x) || !in_range(y) {
        return None;
    }
    Some(Locator::Point {
        x_ratio: x,
        y_ratio: y,
        scroll_percent: req.scroll_percent.filter(|p| in_range(*p)),
    })
}

pub fn text_match(req: &ClickRequest) -> Option<Locator> {
    let text = req.text_content.as_deref()?.trim();
    if text.is_empty() {
        return None;
    }
    Some(Locator::Text {
        selector: req.selector.clone().filter(|s| !s.trim().is_empty()),
        text: text.to_string(),
        index: req.index,
    })
}

/// Every locator the request supports, in strategy order.
pub fn candidates(req: &ClickRequest) -> Vec<(&'static str, Locator)> {
    STRATEGIES
        .iter()
        .filter_map(|(name, strategy)| strategy(req).map(|loc| (*name, loc)))
        .collect()
}
