use ds_core::Source;

/// Section marker framing for marker-routed streams, e.g.
/// `<!--section:risks-->` on its own line.
pub const MARKER_PREFIX: &str = "<!--";
pub const MARKER_SUFFIX: &str = "-->";

/// How streamed text is assigned to sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRoute {
    /// Everything goes to the single configured section.
    Fixed,
    /// `<!--section:<name>-->` markers switch the active section.
    Marker,
}

/// Streaming spec for one `(source, card_type)` pair.
///
/// Only user-facing markdown/text fields stream. Cards that return JSON
/// objects stay non-streaming; partial JSON is poor UX.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub field: &'static str,
    pub format: &'static str,
    pub sections: &'static [&'static str],
    pub route: StreamRoute,
    pub flush_chars: usize,
}

impl StreamSpec {
    pub fn initial_section(&self) -> &'static str {
        self.sections.first().copied().unwrap_or("main")
    }
}

/// Look up the streaming spec for a card, if it streams at all.
pub fn stream_spec(source: Source, card_type: &str) -> Option<StreamSpec> {
    let key = card_type.trim().to_ascii_lowercase();
    match (source, key.as_str()) {
        (Source::Scholar, "criticalreview") => Some(StreamSpec {
            field: "evaluation",
            format: "markdown",
            sections: &["main"],
            route: StreamRoute::Fixed,
            flush_chars: 60,
        }),
        // Scholar summary is a sectioned evaluation; the model emits
        // section markers which route deltas to the right section.
        (Source::Scholar, "summary") => Some(StreamSpec {
            field: "evaluation",
            format: "markdown",
            sections: &["overview", "strengths", "risks", "questions"],
            route: StreamRoute::Marker,
            flush_chars: 160,
        }),
        (Source::Github, "roast") => Some(StreamSpec {
            field: "roast",
            format: "markdown",
            sections: &["main"],
            route: StreamRoute::Fixed,
            flush_chars: 160,
        }),
        (Source::Linkedin, "roast") => Some(StreamSpec {
            field: "roast",
            format: "markdown",
            sections: &["main"],
            route: StreamRoute::Fixed,
            flush_chars: 160,
        }),
        (Source::Linkedin, "summary") => Some(StreamSpec {
            field: "about",
            format: "markdown",
            sections: &["main"],
            route: StreamRoute::Fixed,
            flush_chars: 160,
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(stream_spec(Source::Scholar, "CriticalReview").is_some());
        assert!(stream_spec(Source::Scholar, " criticalreview ").is_some());
    }

    #[test]
    fn json_cards_do_not_stream() {
        assert!(stream_spec(Source::Github, "profile").is_none());
        assert!(stream_spec(Source::Github, "repos").is_none());
        assert!(stream_spec(Source::Linkedin, "money").is_none());
    }

    #[test]
    fn scholar_summary_routes_by_marker() {
        let spec = stream_spec(Source::Scholar, "summary").unwrap();
        assert_eq!(spec.route, StreamRoute::Marker);
        assert_eq!(spec.initial_section(), "overview");
        assert_eq!(spec.sections.len(), 4);
    }

    #[test]
    fn github_roast_is_single_fixed_stream() {
        let spec = stream_spec(Source::Github, "roast").unwrap();
        assert_eq!(spec.route, StreamRoute::Fixed);
        assert_eq!(spec.field, "roast");
        assert_eq!(spec.initial_section(), "main");
    }
}
