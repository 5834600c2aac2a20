//! Output stream parsing.
//!
//! The backend speaks no structured protocol; it prints free-form text on
//! stdout/stderr. This module is the de facto protocol decoder: a table of
//! anchored patterns evaluated in priority order over each line, producing
//! [`OutputEvent`]s. Extraction is deliberately decoupled from the state
//! machines that consume the events, so every pattern can be unit-tested
//! against literal captured log lines.

use std::sync::LazyLock;

use regex::Regex;

/// Which endpoint-announcement phrasing the backend is expected to print
/// first. Both are always accepted; the configured one is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointPhrasing {
    /// Web UI launched alongside the API: `Running on local URL: <url>`.
    WebUi,
    /// API-only mode: `Uvicorn running on <url> (Press CTRL+C to quit)`.
    ApiOnly,
}

/// A structured fact extracted from the output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// The backend announced its HTTP base address.
    EndpointDiscovered(String),
    /// A progress percentage, already converted to a fraction in `[0, 1]`.
    Progress(f32),
    /// The backend confirmed a checkpoint finished loading.
    ModelLoaded { duration_secs: f64 },
    /// The backend reported a checkpoint failed to load. `type_error` is
    /// set for the known hardware-incompatibility signature.
    ModelLoadFailed { type_error: bool },
}

static ENDPOINT_WEBUI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*Running on local URL:\s+(\S+)\s*$").unwrap()
});

static ENDPOINT_API: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:INFO:\s+)?Uvicorn running on (\S+) \(Press CTRL\+C to quit\)\s*$")
        .unwrap()
});

static PROGRESS_LABELED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Total progress:\s*(\d{1,3})%").unwrap());

// Bare percentage lines come from the backend's progress bars, which start
// the line with the number (" 37%|████..."). Anchoring to the line start
// keeps percentages inside unrelated sentences from matching.
static PROGRESS_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,3})%(?:\||\s|$)").unwrap());

static MODEL_LOADED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Model loaded in (\d+(?:\.\d+)?)s").unwrap());

static MODEL_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Stable diffusion model failed to load").unwrap());

/// Exact substring the backend prints when half-precision weights hit the
/// known kernel incompatibility. Remedied by a configuration toggle, so it
/// is classified apart from an ordinary load failure.
pub const TYPE_ERROR_SIGNATURE: &str =
    r#""LayerNormKernelImpl" not implemented for 'Half'"#;

/// Scan a chunk of combined stdout/stderr output.
///
/// Events are emitted in line order; a line yields at most one event. The
/// absence of a match is not an error.
pub fn scan_chunk(chunk: &str, phrasing: EndpointPhrasing) -> Vec<OutputEvent> {
    chunk
        .lines()
        .filter_map(|line| scan_line(line, phrasing))
        .collect()
}

/// Scan a single line, applying patterns in priority order.
pub fn scan_line(line: &str, phrasing: EndpointPhrasing) -> Option<OutputEvent> {
    if let Some(endpoint) = match_endpoint(line, phrasing) {
        return Some(OutputEvent::EndpointDiscovered(endpoint));
    }

    if line.contains(TYPE_ERROR_SIGNATURE) {
        return Some(OutputEvent::ModelLoadFailed { type_error: true });
    }
    if MODEL_FAILED.is_match(line) {
        return Some(OutputEvent::ModelLoadFailed { type_error: false });
    }
    if let Some(caps) = MODEL_LOADED.captures(line) {
        if let Ok(duration_secs) = caps[1].parse::<f64>() {
            return Some(OutputEvent::ModelLoaded { duration_secs });
        }
    }

    // The labeled pattern wins over the bare one when both could match.
    for pattern in [&PROGRESS_LABELED, &PROGRESS_BARE] {
        if let Some(caps) = pattern.captures(line) {
            if let Ok(percent) = caps[1].parse::<u32>() {
                return Some(OutputEvent::Progress(percent.min(100) as f32 / 100.0));
            }
        }
    }

    None
}

fn match_endpoint(line: &str, phrasing: EndpointPhrasing) -> Option<String> {
    let ordered: [&Regex; 2] = match phrasing {
        EndpointPhrasing::WebUi => [&ENDPOINT_WEBUI, &ENDPOINT_API],
        EndpointPhrasing::ApiOnly => [&ENDPOINT_API, &ENDPOINT_WEBUI],
    };
    ordered
        .iter()
        .find_map(|re| re.captures(line))
        .map(|caps| normalize_endpoint(&caps[1]))
}

/// The backend binds to `0.0.0.0` but is only reachable locally; rewrite
/// the wildcard host to the loopback address.
fn normalize_endpoint(url: &str) -> String {
    url.trim_end_matches('/')
        .replacen("//0.0.0.0", "//127.0.0.1", 1)
}
