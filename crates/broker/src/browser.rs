//! Browser identification from the `User-Agent` header, recorded for statistics.

use std::fmt;

/// Browser family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Browser {
    Chrome,
    Firefox,
    Edge,
    Safari,
    Opera,
    InternetExplorer,
    Other,
}

impl Browser {
    /// Identifies the browser family from a `User-Agent` value.
    ///
    /// Order matters: Edge and Opera also advertise `Chrome/`, and Chrome
    /// advertises `Safari/`.
    #[must_use]
    pub fn identify(user_agent: Option<&str>) -> Self {
        let Some(ua) = user_agent else {
            return Self::Other;
        };
        let ua = ua.to_ascii_lowercase();
        if ua.contains("edg/") || ua.contains("edge/") || ua.contains("edga/") {
            Self::Edge
        } else if ua.contains("opr/") || ua.contains("opera") {
            Self::Opera
        } else if ua.contains("msie ") || ua.contains("trident/") {
            Self::InternetExplorer
        } else if ua.contains("chrome/") || ua.contains("crios/") || ua.contains("chromium/") {
            Self::Chrome
        } else if ua.contains("firefox/") || ua.contains("fxios/") {
            Self::Firefox
        } else if ua.contains("safari/") {
            Self::Safari
        } else {
            Self::Other
        }
    }

    /// Name stored in the session and the audit record.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Firefox => "firefox",
            Self::Edge => "edge",
            Self::Safari => "safari",
            Self::Opera => "opera",
            Self::InternetExplorer => "internet_explorer",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
