/// Signatures ffmpeg prints when the upstream stream stalls or drops rather
/// than fails for good.
pub const DEFAULT_LAG_SIGNATURES: [&str; 3] = [
    "Server returned 404 Not Found",
    "Stream ends prematurely",
    "Error in the pull function",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Lagging,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRule {
    pub signature: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Progress,
    Diagnostic,
}

/// Ordered signature rules over ffmpeg's diagnostic output. The first
/// matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticClassifier {
    rules: Vec<SignatureRule>,
}

impl Default for DiagnosticClassifier {
    fn default() -> Self {
        Self::with_extra_lag_signatures(&[])
    }
}

impl DiagnosticClassifier {
    pub fn new(rules: Vec<SignatureRule>) -> Self {
        Self { rules }
    }

    pub fn with_extra_lag_signatures(extra: &[String]) -> Self {
        let rules = DEFAULT_LAG_SIGNATURES
            .iter()
            .map(|signature| signature.to_string())
            .chain(extra.iter().filter(|s| !s.trim().is_empty()).cloned())
            .map(|signature| SignatureRule {
                signature,
                verdict: Verdict::Lagging,
            })
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> &[SignatureRule] {
        &self.rules
    }

    pub fn line_kind(&self, line: &str) -> LineKind {
        let trimmed = line.trim_start();
        if trimmed.contains("frame=") || trimmed.starts_with("size=") {
            LineKind::Progress
        } else {
            LineKind::Diagnostic
        }
    }

    /// `None` for an empty buffer. Unmatched non-empty output is fatal.
    pub fn classify(&self, error_buffer: &str) -> Option<Verdict> {
        if error_buffer.trim().is_empty() {
            return None;
        }
        let verdict = self
            .rules
            .iter()
            .find(|rule| error_buffer.contains(&rule.signature))
            .map(|rule| rule.verdict)
            .unwrap_or(Verdict::Fatal);
        Some(verdict)
    }
}
