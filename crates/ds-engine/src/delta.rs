use std::collections::HashMap;

use ds_rules::{StreamRoute, StreamSpec, MARKER_PREFIX, MARKER_SUFFIX};

/// One flushed run of streamed text, attributed to a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaFlush {
    pub section: String,
    pub delta: String,
}

/// Buffers streamed LLM text and emits section-attributed flushes.
///
/// Flushes fire on paragraph breaks and when the buffer crosses
/// `flush_chars`. With marker routing, `<!--section:<name>-->` switches the
/// active section; unknown or malformed markers are preserved as literal
/// text, and a marker split across chunk boundaries is carried over until
/// it completes.
///
/// Contract: concatenating flushed deltas per section, in emission order,
/// yields exactly the text fed in: no gaps, no duplicates.
pub struct DeltaRouter {
    sections: Vec<String>,
    allowed: HashMap<String, String>,
    section: String,
    route_markers: bool,
    flush_chars: usize,
    carry: String,
    buffer: String,
    totals: Vec<(String, String)>,
    emit: Box<dyn FnMut(DeltaFlush) + Send>,
}

impl DeltaRouter {
    pub fn new(spec: &StreamSpec, emit: impl FnMut(DeltaFlush) + Send + 'static) -> Self {
        let sections: Vec<String> = spec.sections.iter().map(|s| s.to_string()).collect();
        let allowed = sections
            .iter()
            .map(|s| (s.to_lowercase(), s.clone()))
            .collect();
        Self {
            section: spec.initial_section().to_string(),
            route_markers: spec.route == StreamRoute::Marker && sections.len() > 1,
            allowed,
            sections,
            flush_chars: spec.flush_chars.max(40),
            carry: String::new(),
            buffer: String::new(),
            totals: Vec::new(),
            emit: Box::new(emit),
        }
    }

    /// Feed one streamed chunk.
    pub fn on_delta(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        if !self.route_markers {
            self.append(chunk.to_string());
            return;
        }

        let (pieces, final_section) = self.split_by_markers(chunk);
        for (section, text) in pieces {
            if text.is_empty() {
                continue;
            }
            if section != self.section {
                self.flush();
                self.section = section;
            }
            self.append(text);
        }
        if final_section != self.section {
            // Section marker at chunk boundary with no content yet: flush the
            // current buffer to avoid mixing sections.
            self.flush();
            self.section = final_section;
        }
    }

    /// Flush any remaining buffered text and return the per-section totals
    /// in first-emission order.
    pub fn finish(mut self) -> Vec<(String, String)> {
        self.flush();
        self.totals
    }

    /// Declared sections, in spec order.
    pub fn sections(&self) -> &[String] {
        &self.sections
    }

    fn append(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        let has_break = text.contains("\n\n");
        self.buffer.push_str(&text);
        if has_break || self.buffer.len() >= self.flush_chars {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let delta = std::mem::take(&mut self.buffer);
        match self.totals.iter_mut().find(|(s, _)| *s == self.section) {
            Some((_, total)) => total.push_str(&delta),
            None => self.totals.push((self.section.clone(), delta.clone())),
        }
        (self.emit)(DeltaFlush {
            section: self.section.clone(),
            delta,
        });
    }

    /// Split a chunk at section markers, resolving the carry-over from the
    /// previous chunk. Returns the attributed pieces and the section left
    /// active at the end of the chunk.
    fn split_by_markers(&mut self, chunk: &str) -> (Vec<(String, String)>, String) {
        let buf = format!("{}{}", std::mem::take(&mut self.carry), chunk);

        let mut cur = self.section.clone();
        let mut pieces: Vec<(String, String)> = Vec::new();

        let mut pos = 0;
        loop {
            let Some(rel) = buf[pos..].find(MARKER_PREFIX) else {
                break;
            };
            let idx = pos + rel;
            if idx > pos {
                pieces.push((cur.clone(), buf[pos..idx].to_string()));
            }

            let body_start = idx + MARKER_PREFIX.len();
            let Some(end_rel) = buf[body_start..].find(MARKER_SUFFIX) else {
                // Incomplete marker; keep for the next chunk.
                self.carry = buf[idx..].to_string();
                return (pieces, cur);
            };
            let end = body_start + end_rel;

            let body = buf[body_start..end].trim();
            let mut literal = true;
            if let Some(prefix) = body.get(..8) {
                if prefix.eq_ignore_ascii_case("section:") {
                    let raw_name = body[8..].trim();
                    if let Some(canonical) = self.allowed.get(raw_name.to_lowercase().as_str()) {
                        cur = canonical.clone();
                        literal = false;
                    }
                }
            }
            if literal {
                // Not a known section marker: keep as literal text.
                pieces.push((cur.clone(), buf[idx..end + MARKER_SUFFIX.len()].to_string()));
            }

            pos = end + MARKER_SUFFIX.len();
        }

        let mut tail = &buf[pos..];
        // A partial marker prefix at the chunk edge carries to the next chunk.
        let max_check = (MARKER_PREFIX.len() - 1).min(tail.len());
        for i in (1..=max_check).rev() {
            if !tail.is_char_boundary(tail.len() - i) {
                continue;
            }
            let suffix = &tail[tail.len() - i..];
            if MARKER_PREFIX.starts_with(suffix) {
                self.carry = suffix.to_string();
                tail = &tail[..tail.len() - i];
                break;
            }
        }
        if !tail.is_empty() {
            pieces.push((cur.clone(), tail.to_string()));
        }
        (pieces, cur)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ds_core::Source;
    use ds_rules::stream_spec;
    use std::sync::{Arc, Mutex};

    fn collecting_router(spec: &StreamSpec) -> (DeltaRouter, Arc<Mutex<Vec<DeltaFlush>>>) {
        let flushes: Arc<Mutex<Vec<DeltaFlush>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = flushes.clone();
        let router = DeltaRouter::new(spec, move |flush| sink.lock().unwrap().push(flush));
        (router, flushes)
    }

    fn reassemble(flushes: &[DeltaFlush]) -> HashMap<String, String> {
        let mut out: HashMap<String, String> = HashMap::new();
        for flush in flushes {
            out.entry(flush.section.clone())
                .or_default()
                .push_str(&flush.delta);
        }
        out
    }

    #[test]
    fn fixed_route_flushes_on_paragraph_break() {
        let spec = stream_spec(Source::Github, "roast").unwrap();
        let (mut router, flushes) = collecting_router(&spec);

        router.on_delta("Your commit history reads");
        assert!(flushes.lock().unwrap().is_empty());
        router.on_delta(" like a crime scene.\n\nAnd");
        assert_eq!(flushes.lock().unwrap().len(), 1);

        let totals = router.finish();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].0, "main");
        assert_eq!(
            totals[0].1,
            "Your commit history reads like a crime scene.\n\nAnd"
        );
    }

    #[test]
    fn fixed_route_flushes_on_size_threshold() {
        let spec = stream_spec(Source::Scholar, "criticalReview").unwrap();
        let (mut router, flushes) = collecting_router(&spec);

        // flush_chars for criticalReview is 60.
        router.on_delta(&"a".repeat(70));
        assert_eq!(flushes.lock().unwrap().len(), 1);
        drop(router);
    }

    #[test]
    fn marker_route_switches_sections() {
        let spec = stream_spec(Source::Scholar, "summary").unwrap();
        let (mut router, flushes) = collecting_router(&spec);

        router.on_delta("<!--section:overview-->\nSolid researcher.\n");
        router.on_delta("<!--section:strengths-->\nDeep systems work.\n");
        router.on_delta("<!--section:risks-->\nNarrow collaborations.\n");
        let _ = router.finish();

        let by_section = reassemble(&flushes.lock().unwrap());
        assert_eq!(by_section["overview"], "\nSolid researcher.\n");
        assert_eq!(by_section["strengths"], "\nDeep systems work.\n");
        assert_eq!(by_section["risks"], "\nNarrow collaborations.\n");
    }

    #[test]
    fn marker_split_across_chunks_routes_correctly() {
        let spec = stream_spec(Source::Scholar, "summary").unwrap();
        let (mut router, flushes) = collecting_router(&spec);

        router.on_delta("intro text");
        router.on_delta("<!--sec");
        router.on_delta("tion:risks-->overcommitted");
        let _ = router.finish();

        let by_section = reassemble(&flushes.lock().unwrap());
        assert_eq!(by_section["overview"], "intro text");
        assert_eq!(by_section["risks"], "overcommitted");
    }

    #[test]
    fn unknown_marker_is_preserved_as_literal_text() {
        let spec = stream_spec(Source::Scholar, "summary").unwrap();
        let (mut router, _) = collecting_router(&spec);

        router.on_delta("before <!--section:nonexistent--> after");
        router.on_delta(" <!--just a comment--> end");
        let totals = router.finish();

        assert_eq!(totals.len(), 1);
        assert_eq!(
            totals[0].1,
            "before <!--section:nonexistent--> after <!--just a comment--> end"
        );
    }

    #[test]
    fn concatenated_deltas_equal_input_per_section() {
        let spec = stream_spec(Source::Scholar, "summary").unwrap();
        let (mut router, flushes) = collecting_router(&spec);

        let full = "<!--section:overview-->One.\n\nTwo.<!--section:questions-->Why Rust?";
        // Feed in awkward 7-byte chunks to stress carry handling.
        let bytes = full.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            let end = (start + 7).min(bytes.len());
            router.on_delta(std::str::from_utf8(&bytes[start..end]).unwrap());
            start = end;
        }
        let totals = router.finish();

        let by_section = reassemble(&flushes.lock().unwrap());
        assert_eq!(by_section["overview"], "One.\n\nTwo.");
        assert_eq!(by_section["questions"], "Why Rust?");
        // Totals agree with emitted flushes.
        for (section, text) in totals {
            assert_eq!(by_section[&section], text);
        }
    }

    #[test]
    fn trailing_partial_prefix_is_carried() {
        let spec = stream_spec(Source::Scholar, "summary").unwrap();
        let (mut router, _) = collecting_router(&spec);

        router.on_delta("text ends with <!");
        router.on_delta("--section:strengths-->strong");
        let totals = router.finish();

        let overview: &String = &totals
            .iter()
            .find(|(s, _)| s == "overview")
            .map(|(_, t)| t.clone())
            .unwrap();
        assert_eq!(overview, "text ends with ");
        assert!(totals.iter().any(|(s, t)| s == "strengths" && t == "strong"));
    }
}
