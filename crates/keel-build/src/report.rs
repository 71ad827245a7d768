use crate::error::BuildError;

pub const PREFIX: &str = "KEEL_BUILD_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 4 * 1024;
const MAX_DIAGNOSTIC_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FailureReport {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Keeps the tail of installer output; the failure is usually at the end.
fn truncate_tail_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let prefix = "(truncated)…";
    let keep = max_bytes.saturating_sub(prefix.len()).max(1);
    let mut start = s.len().saturating_sub(keep);
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    format!("{prefix}{}", &s[start..])
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl FailureReport {
    pub fn from_error(err: &BuildError) -> Self {
        let (step_index, step_kind, diagnostic) = match err {
            BuildError::StepExecutionFailure {
                index,
                kind,
                diagnostic,
            } => (
                Some(*index),
                Some(kind.to_string()),
                Some(truncate_tail_utf8(diagnostic, MAX_DIAGNOSTIC_BYTES)),
            ),
            _ => (None, None, None),
        };

        Self {
            code: err.code().to_string(),
            message: truncate_utf8(&err.to_string(), MAX_MESSAGE_BYTES),
            step_index,
            step_kind,
            diagnostic,
        }
    }
}

pub fn encode(err: &BuildError) -> String {
    let json = serde_json::to_string(&FailureReport::from_error(err))
        .unwrap_or_else(|_| "{\"code\":\"internal\",\"message\":\"serialize_failed\"}".to_string());
    format!("{PREFIX}{json}")
}

/// Process exit code for a failed build.
pub fn exit_code(err: &BuildError) -> i32 {
    match err {
        BuildError::UnsatisfiableConstraint { .. } => 2,
        _ => 1,
    }
}
