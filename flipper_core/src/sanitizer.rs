use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

const ASAN_ERROR_MARKER: &str = "ERROR: AddressSanitizer:";

static SUMMARY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"SUMMARY:\s*([a-zA-Z_]+Sanitizer):\s*([a-zA-Z0-9_-]+(?:-after-[a-zA-Z0-9_-]+)?)")
        .expect("summary pattern is a valid regex")
});

static DEFAULT_CLASSIFIER: LazyLock<SanitizerClassifier> =
    LazyLock::new(SanitizerClassifier::default);

/// Identity of the runtime checker that produced a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sanitizer {
    Address,
    UndefinedBehavior,
    Leak,
    Thread,
    Memory,
    /// A `*Sanitizer` name seen in a summary line that is not otherwise known.
    Other(String),
}

impl Sanitizer {
    /// Known sanitizers in the order the bare-name fallback looks for them.
    pub const FALLBACK_PRIORITY: [Sanitizer; 5] = [
        Sanitizer::Address,
        Sanitizer::UndefinedBehavior,
        Sanitizer::Leak,
        Sanitizer::Thread,
        Sanitizer::Memory,
    ];

    pub fn name(&self) -> &str {
        match self {
            Sanitizer::Address => "AddressSanitizer",
            Sanitizer::UndefinedBehavior => "UndefinedBehaviorSanitizer",
            Sanitizer::Leak => "LeakSanitizer",
            Sanitizer::Thread => "ThreadSanitizer",
            Sanitizer::Memory => "MemorySanitizer",
            Sanitizer::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self::FALLBACK_PRIORITY
            .iter()
            .find(|known| known.name() == name)
            .cloned()
            .unwrap_or_else(|| Sanitizer::Other(name.to_string()))
    }
}

impl fmt::Display for Sanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of classifying one block of diagnostic text.
///
/// When `detected` is false every other field is empty. When it is true,
/// `sanitizer` is always set; `error_kind` and `evidence` are only left empty
/// by the bare-name fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizerFinding {
    pub detected: bool,
    pub sanitizer: Option<Sanitizer>,
    /// Hyphenated identifier such as `heap-buffer-overflow`.
    pub error_kind: String,
    /// The verbatim line that triggered detection.
    pub evidence: String,
}

impl SanitizerFinding {
    pub fn detected(sanitizer: Sanitizer, error_kind: &str, evidence: &str) -> Self {
        Self {
            detected: true,
            sanitizer: Some(sanitizer),
            error_kind: error_kind.to_string(),
            evidence: evidence.to_string(),
        }
    }

    /// Name of the detected sanitizer, or `""` when nothing was detected.
    pub fn sanitizer_name(&self) -> &str {
        self.sanitizer.as_ref().map_or("", Sanitizer::name)
    }
}

/// A matcher that inspects one line at a time.
pub trait LineMatcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn match_line(&self, line: &str) -> Option<SanitizerFinding>;
}

/// A matcher that only makes sense over the whole text.
pub trait TextMatcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn match_text(&self, text: &str) -> Option<SanitizerFinding>;
}

/// Matches `SUMMARY: <Name>Sanitizer: <error-kind> ...` lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct SummaryLineMatcher;

impl LineMatcher for SummaryLineMatcher {
    fn name(&self) -> &'static str {
        "summary"
    }

    fn match_line(&self, line: &str) -> Option<SanitizerFinding> {
        let captures = SUMMARY_PATTERN.captures(line)?;
        Some(SanitizerFinding::detected(
            Sanitizer::from_name(&captures[1]),
            &captures[2],
            line,
        ))
    }
}

/// Matches the `==pid==ERROR: AddressSanitizer: <kind> on address ...` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct AsanErrorLineMatcher;

impl LineMatcher for AsanErrorLineMatcher {
    fn name(&self) -> &'static str {
        "asan-error"
    }

    fn match_line(&self, line: &str) -> Option<SanitizerFinding> {
        let position = line.find(ASAN_ERROR_MARKER)?;
        let details = &line[position + ASAN_ERROR_MARKER.len()..];
        let token = details.split_whitespace().next().unwrap_or_default();
        let error_kind = token.strip_suffix(" on").unwrap_or(token);
        Some(SanitizerFinding::detected(
            Sanitizer::Address,
            error_kind,
            line,
        ))
    }
}

/// Last resort: the first known sanitizer name appearing anywhere in the text.
#[derive(Debug, Clone)]
pub struct BareNameMatcher {
    priority: Vec<Sanitizer>,
}

impl BareNameMatcher {
    pub fn new(priority: Vec<Sanitizer>) -> Self {
        Self { priority }
    }
}

impl Default for BareNameMatcher {
    fn default() -> Self {
        Self::new(Sanitizer::FALLBACK_PRIORITY.to_vec())
    }
}

impl TextMatcher for BareNameMatcher {
    fn name(&self) -> &'static str {
        "bare-name"
    }

    fn match_text(&self, text: &str) -> Option<SanitizerFinding> {
        let sanitizer = self
            .priority
            .iter()
            .find(|sanitizer| text.contains(sanitizer.name()))?;
        Some(SanitizerFinding::detected(sanitizer.clone(), "", ""))
    }
}

/// Classifies sanitizer diagnostics with an ordered list of matchers.
///
/// Lines are visited in order; on each line the line matchers are tried in
/// priority order and the first hit is returned. Only when no line matched
/// are the text matchers consulted. A text-level hit without evidence gets the
/// first line mentioning its sanitizer as evidence.
pub struct SanitizerClassifier {
    line_matchers: Vec<Box<dyn LineMatcher>>,
    text_matchers: Vec<Box<dyn TextMatcher>>,
}

impl SanitizerClassifier {
    pub fn new(
        line_matchers: Vec<Box<dyn LineMatcher>>,
        text_matchers: Vec<Box<dyn TextMatcher>>,
    ) -> Self {
        Self {
            line_matchers,
            text_matchers,
        }
    }

    pub fn classify(&self, text: &str) -> SanitizerFinding {
        // Split on `\n` only so a `\r` stays part of the evidence line.
        for line in text.split('\n') {
            if let Some(finding) = self
                .line_matchers
                .iter()
                .find_map(|matcher| matcher.match_line(line))
            {
                return finding;
            }
        }

        let Some(mut finding) = self
            .text_matchers
            .iter()
            .find_map(|matcher| matcher.match_text(text))
        else {
            return SanitizerFinding::default();
        };

        if finding.evidence.is_empty() {
            let name = finding.sanitizer_name();
            if let Some(line) = text.split('\n').find(|line| line.contains(name)) {
                finding.evidence = line.to_string();
            }
        }
        finding
    }

    pub fn classify_bytes(&self, diagnostics: &[u8]) -> SanitizerFinding {
        self.classify(&String::from_utf8_lossy(diagnostics))
    }
}

impl Default for SanitizerClassifier {
    fn default() -> Self {
        Self::new(
            vec![Box::new(SummaryLineMatcher), Box::new(AsanErrorLineMatcher)],
            vec![Box::new(BareNameMatcher::default())],
        )
    }
}

impl fmt::Debug for SanitizerClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<_> = self.line_matchers.iter().map(|m| m.name()).collect();
        let texts: Vec<_> = self.text_matchers.iter().map(|m| m.name()).collect();
        f.debug_struct("SanitizerClassifier")
            .field("line_matchers", &lines)
            .field("text_matchers", &texts)
            .finish()
    }
}

/// Classifies `text` with the default matcher tiers.
pub fn classify(text: &str) -> SanitizerFinding {
    DEFAULT_CLASSIFIER.classify(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASAN_HEAP_OVERFLOW: &str = "=================================================================\n\
        ==12345==ERROR: AddressSanitizer: heap-buffer-overflow on address 0xdeadbeef at pc 0x000000400080 bp 0x7ffd9778e6a0 sp 0x7ffd9778e698\n\
        READ of size 4 at 0xdeadbeef thread T0\n    #0 0x40007f in main /path/to/source.c:10\n\
        SUMMARY: AddressSanitizer: heap-buffer-overflow /path/to/source.c:10 in main\n";

    #[test]
    fn no_issue_in_plain_errors() {
        let finding = classify("Error: File not found.\nPermission denied.\n");
        assert!(!finding.detected);
        assert_eq!(finding.sanitizer, None);
        assert!(finding.error_kind.is_empty());
        assert!(finding.evidence.is_empty());
        assert_eq!(finding, SanitizerFinding::default());
    }

    #[test]
    fn empty_text_is_not_detected() {
        assert_eq!(classify(""), SanitizerFinding::default());
    }

    #[test]
    fn summary_line_is_evidence() {
        let line = "SUMMARY: AddressSanitizer: heap-buffer-overflow /path/to/source.c:10 in main";
        let finding = classify(&format!("noise\n{line}\nmore noise\n"));
        assert!(finding.detected);
        assert_eq!(finding.sanitizer_name(), "AddressSanitizer");
        assert!(finding.error_kind.contains("heap-buffer-overflow"));
        assert_eq!(finding.evidence, line);
    }

    #[test]
    fn ubsan_summary_is_classified() {
        let text = "/app/example.cpp:20:10: runtime error: signed integer overflow: 2147483647 + 1 cannot be represented in type 'int'\n\
            SUMMARY: UndefinedBehaviorSanitizer: signed-integer-overflow /app/example.cpp:20:10 in main\n";
        let finding = classify(text);
        assert_eq!(finding.sanitizer, Some(Sanitizer::UndefinedBehavior));
        assert_eq!(finding.error_kind, "signed-integer-overflow");
    }

    #[test]
    fn after_style_error_kind_is_captured_whole() {
        let finding = SummaryLineMatcher
            .match_line("SUMMARY: AddressSanitizer: heap-use-after-free /app/src/main.cpp:42")
            .unwrap();
        assert_eq!(finding.error_kind, "heap-use-after-free");
    }

    #[test]
    fn unknown_sanitizer_name_is_kept() {
        let finding = classify("SUMMARY: HWAddressSanitizer: tag-mismatch x.c:1 in f\n");
        assert_eq!(finding.sanitizer, Some(Sanitizer::Other("HWAddressSanitizer".into())));
        assert_eq!(finding.error_kind, "tag-mismatch");
    }

    #[test]
    fn asan_error_line_without_summary() {
        let line = "==1==ERROR: AddressSanitizer: stack-use-after-return on address 0x7f00";
        let finding = classify(&format!("{line}\nREAD of size 8\n"));
        assert!(finding.detected);
        assert_eq!(finding.sanitizer, Some(Sanitizer::Address));
        assert_eq!(finding.error_kind, "stack-use-after-return");
        assert_eq!(finding.evidence, line);
    }

    #[test]
    fn asan_error_line_with_nothing_after_marker() {
        let finding = AsanErrorLineMatcher
            .match_line("==1==ERROR: AddressSanitizer:")
            .unwrap();
        assert!(finding.detected);
        assert!(finding.error_kind.is_empty());
    }

    #[test]
    fn tiers_are_tried_per_line_in_order() {
        // The error header comes first, so it wins over the later summary.
        let finding = classify(ASAN_HEAP_OVERFLOW);
        assert!(finding.evidence.contains("ERROR: AddressSanitizer"));
        assert_eq!(finding.error_kind, "heap-buffer-overflow");

        // On a summary-first report the summary line wins.
        let text = "SUMMARY: AddressSanitizer: stack-buffer-overflow /path/to/another.c:30 in foo\n\
            ==ERROR: AddressSanitizer: stack-buffer-overflow on address ...";
        let finding = classify(text);
        assert!(finding.evidence.starts_with("SUMMARY:"));
        assert_eq!(finding.error_kind, "stack-buffer-overflow");
    }

    #[test]
    fn bare_name_fallback_uses_priority_and_backfills_evidence() {
        let text = "warning from UndefinedBehaviorSanitizer runtime\n\
            AddressSanitizer:DEADLYSIGNAL\n";
        let finding = classify(text);
        assert!(finding.detected);
        assert_eq!(finding.sanitizer, Some(Sanitizer::Address));
        assert!(finding.error_kind.is_empty());
        assert_eq!(finding.evidence, "AddressSanitizer:DEADLYSIGNAL");
    }

    #[test]
    fn bare_name_fallback_for_ubsan() {
        let finding = classify("UndefinedBehaviorSanitizer: nothing structured here\n");
        assert_eq!(finding.sanitizer, Some(Sanitizer::UndefinedBehavior));
        assert_eq!(finding.evidence, "UndefinedBehaviorSanitizer: nothing structured here");
    }

    #[test]
    fn leak_sanitizer_summary() {
        let finding =
            classify("SUMMARY: LeakSanitizer: 64 byte(s) leaked in 1 allocation(s).\n");
        // The error kind token must be hyphen-joined; a bare count still matches.
        assert_eq!(finding.sanitizer, Some(Sanitizer::Leak));
        assert_eq!(finding.error_kind, "64");
    }

    #[test]
    fn classification_is_deterministic() {
        let first = classify(ASAN_HEAP_OVERFLOW);
        for _ in 0..10 {
            assert_eq!(classify(ASAN_HEAP_OVERFLOW), first);
        }
    }

    #[test]
    fn custom_tiers_can_be_composed() {
        let summary_only = SanitizerClassifier::new(vec![Box::new(SummaryLineMatcher)], vec![]);
        let finding = summary_only.classify("==1==ERROR: AddressSanitizer: heap-use-after-free\n");
        assert!(!finding.detected);
    }

    #[test]
    fn summary_pattern_compiles() {
        assert!(LazyLock::force(&SUMMARY_PATTERN).captures_len() > 2);
    }

    #[test]
    fn crlf_evidence_keeps_carriage_return() {
        let finding = classify("noise\r\nSUMMARY: AddressSanitizer: SEGV x.c:3 in f\r\n");
        assert_eq!(finding.error_kind, "SEGV");
        assert_eq!(finding.evidence, "SUMMARY: AddressSanitizer: SEGV x.c:3 in f\r");

        let fallback = classify("MemorySanitizer says hi\r\n");
        assert_eq!(fallback.sanitizer, Some(Sanitizer::Memory));
        assert_eq!(fallback.evidence, "MemorySanitizer says hi\r");
    }

    #[test]
    fn classify_bytes_tolerates_invalid_utf8() {
        let mut bytes = b"\xff\xfe garbage\n".to_vec();
        bytes.extend_from_slice(b"SUMMARY: AddressSanitizer: SEGV x.c:3 in f\n");
        let finding = SanitizerClassifier::default().classify_bytes(&bytes);
        assert_eq!(finding.error_kind, "SEGV");
    }
}
