//! Stream-safe secret redaction.
//!
//! Replaces every occurrence of any mask value with `***` before log
//! fragments are emitted. A mask value that straddles a fragment boundary is
//! caught by holding back a tail bounded by the longest mask value until
//! enough bytes arrive to decide.

const MASK: &str = "***";

/// Redacts mask values from a stream of text fragments.
///
/// One masker instance covers one logical stream (a single step's stdout or
/// stderr); instances are not shared across streams.
#[derive(Debug, Clone)]
pub struct StreamMasker {
    values: Vec<String>,
    max_len: usize,
    pending: String,
}

impl StreamMasker {
    /// Empty and whitespace-only mask values are ignored.
    pub fn new(values: &[String]) -> Self {
        let values: Vec<String> = values
            .iter()
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .collect();
        let max_len = values.iter().map(|v| v.len()).max().unwrap_or(0);
        Self {
            values,
            max_len,
            pending: String::new(),
        }
    }

    /// Whether any mask values are active.
    pub fn is_active(&self) -> bool {
        !self.values.is_empty()
    }

    /// Feed a fragment; returns the text that is safe to emit now.
    pub fn push(&mut self, fragment: &str) -> String {
        if self.values.is_empty() {
            return fragment.to_string();
        }
        self.pending.push_str(fragment);
        let masked = self.mask_all(&self.pending.clone());

        // Hold back the longest tail that could still be a mask prefix.
        let holdback = self.partial_suffix_len(&masked);
        let emit_to = masked.len() - holdback;
        let out = masked[..emit_to].to_string();
        self.pending = masked[emit_to..].to_string();
        out
    }

    /// Flush whatever is buffered at end of stream.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        let out = self.mask_all(&pending);
        out
    }

    /// Convenience for one-shot masking of a complete string.
    pub fn mask_full(values: &[String], text: &str) -> String {
        let masker = Self::new(values);
        masker.mask_all(text)
    }

    fn mask_all(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), MASK);
            }
        }
        out
    }

    /// Length of the longest suffix of `text` that is a proper prefix of any
    /// mask value. That suffix cannot be emitted yet.
    fn partial_suffix_len(&self, text: &str) -> usize {
        let max = (self.max_len.saturating_sub(1)).min(text.len());
        for take in (1..=max).rev() {
            if !text.is_char_boundary(text.len() - take) {
                continue;
            }
            let suffix = &text[text.len() - take..];
            if self
                .values
                .iter()
                .any(|v| v.len() > take && v.as_bytes().starts_with(suffix.as_bytes()))
            {
                return take;
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masks(vals: &[&str]) -> Vec<String> {
        vals.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn masks_whole_fragment() {
        let mut m = StreamMasker::new(&masks(&["hunter2"]));
        let mut out = m.push("password is hunter2 ok");
        out.push_str(&m.finish());
        assert_eq!(out, "password is *** ok");
    }

    #[test]
    fn masks_value_split_across_fragments() {
        let mut m = StreamMasker::new(&masks(&["hunter2"]));
        let mut out = String::new();
        out.push_str(&m.push("hun"));
        out.push_str(&m.push("ter2 trailing"));
        out.push_str(&m.finish());
        assert_eq!(out, "*** trailing");
    }

    #[test]
    fn no_intermediate_emission_leaks_a_prefix() {
        let mut m = StreamMasker::new(&masks(&["hunter2"]));
        let first = m.push("hun");
        // "hun" is a possible prefix of the mask and must be held back.
        assert_eq!(first, "");
    }

    #[test]
    fn flush_emits_innocent_partial() {
        let mut m = StreamMasker::new(&masks(&["hunter2"]));
        let mut out = String::new();
        out.push_str(&m.push("hunt"));
        out.push_str(&m.push("ing season"));
        out.push_str(&m.finish());
        assert_eq!(out, "hunting season");
    }

    #[test]
    fn multiple_values_and_repeats() {
        let mut m = StreamMasker::new(&masks(&["alpha", "beta"]));
        let mut out = String::new();
        out.push_str(&m.push("alpha then be"));
        out.push_str(&m.push("ta then alpha"));
        out.push_str(&m.finish());
        assert_eq!(out, "*** then *** then ***");
    }

    #[test]
    fn empty_and_whitespace_values_ignored() {
        let mut m = StreamMasker::new(&masks(&["", "  ", "secret"]));
        let mut out = m.push("a secret here");
        out.push_str(&m.finish());
        assert_eq!(out, "a *** here");
    }

    #[test]
    fn no_masks_passes_through() {
        let mut m = StreamMasker::new(&[]);
        assert_eq!(m.push("anything"), "anything");
        assert_eq!(m.finish(), "");
    }

    #[test]
    fn byte_at_a_time() {
        let mut m = StreamMasker::new(&masks(&["hunter2"]));
        let mut out = String::new();
        for ch in "say hunter2 now".chars() {
            out.push_str(&m.push(&ch.to_string()));
        }
        out.push_str(&m.finish());
        assert_eq!(out, "say *** now");
    }
}
