use serde::{Deserialize, Serialize};

/// One page of the ratings source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingsPage {
    #[serde(default)]
    pub items: Vec<RawRating>,
    /// Continuation cursor; absent or empty on the last page.
    #[serde(default)]
    pub next_page: Option<String>,
}

impl RatingsPage {
    pub fn next_cursor(&self) -> Option<&str> {
        self.next_page
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Rating record exactly as the source sends it. Every field is a string and may be empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRating {
    #[serde(default)]
    pub ticker: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub brokerage: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub rating_from: String,
    #[serde(default)]
    pub rating_to: String,
    #[serde(default)]
    pub target_from: String,
    #[serde(default)]
    pub target_to: String,
    #[serde(default)]
    pub time: String,
}
