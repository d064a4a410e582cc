//! Text-line handling for subprocess output: ANSI stripping and noise filtering.

use std::sync::LazyLock;

use super::{EventKind, StreamEvent, normalize_json_line};

/// First characters that mark CLI decoration rather than agent output.
const DECORATION_PREFIXES: &[char] = &[
    '💻', '🤖', '✓', '⚙', '🔍', '📋', '⏳', '📦', '💰', '💾', '▶', '►', '🚀', '⚠', '■', '•', '›',
    '💕', '⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏',
];

/// Characters counted towards the box-drawing ratio.
const BOX_CHARS: &[char] = &['═', '║', '╔', '╗', '╚', '╝', '─', '│', '|', ' '];

/// Lines whose box-drawing share exceeds this ratio are dropped.
const BOX_RATIO_THRESHOLD: f64 = 0.5;

/// Default substrings marking banner, planner, and startup output.
///
/// Sample data for the parent CLI's current output; extend it through
/// configuration rather than editing it for every CLI release.
static DEFAULT_NOISE_PATTERNS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        // Box drawing
        "═══", "╔", "╗", "║", "╚", "╝", "╠", "╣", "───", "┌", "┐", "└", "┘", "│",
        // Update notices
        "UPDATE AVAILABLE", "Current version:", "Latest version:", "Run 'kubiya update'",
        // Execution headers
        "Executing task:", "Direct Execution", "Using agent:",
        // Log prefixes
        "[DEBUG]", "[INFO]", "INFO:", "WARNING:",
        // Worker startup
        "Python environment", "Installing dependencies", "Dependencies installed", "SUCCESS:",
        "Starting worker process", "Worker started", "Worker is polling", "Worker ready",
        "Still waiting", "Press Ctrl+C", "Worker Startup", "Setting up Python",
        "Package manager detected", "Fetching latest version", "Latest version found",
        "Worker process", "Virtual environment", "Virtual env exists", "Installing package",
        "uv is available", "Using uv", "kubiya-worker-controller",
        // Planner output
        "Phase 1:", "Responsibilities:", "Estimated Time:", "Identified Risks", "Prerequisites",
        "Success Criteria", "Cost Estimate", "Task Breakdown", "Recommended Execution",
        "No environment specified", "Auto-selected", "Creating ephemeral", "Starting local worker",
        "Control Plane:", "Queue:", "WebUI:", "(First run may take", "Status: Active",
        "Local Execution Mode", "Running with ephemeral", "Using fast planning",
        "Discovering available resources", "Discovered ", "Generating execution plan",
        "[initializing]", "[analyzing]", "[generating]", "Analyzing agents", "Task Analyzer",
        "Resource Selector", "Creating detailed execution plan", "Plan Summary", "Execution Plan",
        "Selected Agent", "Task Description", "Execution Steps", "Risk Assessment", "Plan approved",
        "ephemeral worker",
        // Step counters and bullets
        "[1/", "[2/", "[3/", "[4/", "[5/", "• ", "✓ ", "⚠ ", "■ ", "› ",
        // Headers echoed around a run
        "Agent:", "Task:", "Environment:", "Model:", "Agent execution started",
        "Execution completed", "Session ended", "Plan ID:", "Agent ID:", "Team ID:",
    ]
});

/// Remove terminal escape sequences (ESC through the next ASCII letter).
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_escape = false;
    for c in line.chars() {
        if c == '\x1b' {
            in_escape = true;
        } else if in_escape {
            if c.is_ascii_alphabetic() {
                in_escape = false;
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Heuristic classifier for CLI decoration and progress output.
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    decoration_prefixes: Vec<char>,
    patterns: Vec<String>,
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::with_patterns(DEFAULT_NOISE_PATTERNS.iter().map(|p| p.to_string()))
    }
}

impl NoiseFilter {
    /// Filter using exactly the given substring patterns.
    pub fn with_patterns(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            decoration_prefixes: DECORATION_PREFIXES.to_vec(),
            patterns: patterns.into_iter().filter(|p| !p.is_empty()).collect(),
        }
    }

    /// Default patterns plus `extra`.
    pub fn with_extra_patterns(extra: &[String]) -> Self {
        let mut filter = Self::default();
        filter
            .patterns
            .extend(extra.iter().filter(|p| !p.is_empty()).cloned());
        filter
    }

    /// Whether `line` (ANSI already stripped, untrimmed) is decoration.
    /// JSON lines are never noise.
    pub fn is_noise(&self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return true;
        }
        if trimmed.starts_with('{') {
            return false;
        }
        if trimmed
            .chars()
            .next()
            .is_some_and(|c| self.decoration_prefixes.contains(&c))
        {
            return true;
        }
        if line.starts_with("   ") || line.starts_with("\t\t") || trimmed.starts_with("Progress:") {
            return true;
        }
        if self.patterns.iter().any(|p| line.contains(p.as_str())) {
            return true;
        }

        let total = trimmed.chars().count();
        let boxy = trimmed.chars().filter(|c| BOX_CHARS.contains(c)).count();
        if boxy as f64 / total as f64 > BOX_RATIO_THRESHOLD {
            return true;
        }

        trimmed.chars().all(|c| matches!(c, '|' | ' ' | '\t'))
    }
}

/// Which pipe a subprocess line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Stream format requested from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("json") {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
        }
    }
}

/// Turn one raw subprocess line into at most one event.
///
/// JSON events with a payload always pass. Noise is dropped. In text mode the
/// remaining lines become `text` events; in JSON mode stray stdout text is
/// kept and stderr is reduced to error-looking lines.
pub fn classify_line(
    raw: &str,
    stream: OutputStream,
    format: OutputFormat,
    filter: &NoiseFilter,
) -> Option<StreamEvent> {
    let line = strip_ansi(raw);
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with('{') {
        if let Some(event) = normalize_json_line(trimmed) {
            if event.has_payload() {
                return Some(event);
            }
        }
    }

    if filter.is_noise(&line) {
        return None;
    }

    match (format, stream) {
        (OutputFormat::Json, OutputStream::Stderr) => trimmed
            .to_lowercase()
            .contains("error")
            .then(|| StreamEvent::error(trimmed)),
        _ => Some(StreamEvent::new(EventKind::Text, trimmed)),
    }
}
