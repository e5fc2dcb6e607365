//! Output contract checking for sandboxed candidates.
//!
//! A candidate's stdout must end with a JSON object line declaring at least a
//! `status` field and a `result` field. The check is structural — the core
//! never judges semantic correctness beyond this shape.

use serde_json::Value;

/// Statuses a candidate may report for a successful run.
const SUCCESS_STATUSES: &[&str] = &["ok", "success"];

/// Check `stdout` against the output contract.
///
/// Returns the parsed output object on success, or a human-readable
/// description of the violation.
pub fn check_output_contract(stdout: &str) -> std::result::Result<Value, String> {
    let parsed = last_json_object(stdout)
        .ok_or_else(|| "stdout contains no JSON object line".to_string())?;

    let object = parsed
        .as_object()
        .ok_or_else(|| "candidate output must be a JSON object".to_string())?;

    let status = object
        .get("status")
        .ok_or_else(|| "candidate output is missing 'status' field".to_string())?;
    let result = object
        .get("result")
        .ok_or_else(|| "candidate output is missing 'result' field".to_string())?;

    let status_text = status.as_str().unwrap_or_default().trim().to_lowercase();
    if !SUCCESS_STATUSES.contains(&status_text.as_str()) {
        return Err(format!(
            "candidate status must indicate success, got: {status}"
        ));
    }

    if result.is_null() {
        return Err("candidate 'result' cannot be null".to_string());
    }
    if let Some(text) = result.as_str() {
        if text.trim().is_empty() {
            return Err("candidate 'result' cannot be empty text".to_string());
        }
    }

    Ok(parsed)
}

/// Parse the last line of `stdout` that is a JSON object.
///
/// Candidates may print diagnostics before their payload; only the final
/// object line counts.
fn last_json_object(stdout: &str) -> Option<Value> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| {
            serde_json::from_str::<Value>(line)
                .ok()
                .filter(Value::is_object)
        })
}

/// Extract a bounded preview of the output's `result` field.
pub fn result_preview(output: &Value, limit: usize) -> String {
    let text = match output.get("result") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_output_passes() {
        let out = check_output_contract("{\"status\": \"ok\", \"result\": \"42\"}\n");
        assert!(out.is_ok());
    }

    #[test]
    fn test_diagnostic_lines_before_payload_are_ignored() {
        let stdout = "installing...\nprogress 50%\n{\"status\": \"success\", \"result\": 7}\n";
        let out = check_output_contract(stdout).expect("last line wins");
        assert_eq!(out["result"], 7);
    }

    #[test]
    fn test_missing_status_is_violation() {
        let err = check_output_contract("{\"result\": \"x\"}").unwrap_err();
        assert!(err.contains("'status'"));
    }

    #[test]
    fn test_missing_result_is_violation() {
        let err = check_output_contract("{\"status\": \"ok\"}").unwrap_err();
        assert!(err.contains("'result'"));
    }

    #[test]
    fn test_error_status_is_violation() {
        let err =
            check_output_contract("{\"status\": \"error\", \"result\": \"boom\"}").unwrap_err();
        assert!(err.contains("status"));
    }

    #[test]
    fn test_non_json_output_is_violation() {
        let err = check_output_contract("plain text only\n").unwrap_err();
        assert!(err.contains("no JSON object"));
    }

    #[test]
    fn test_empty_result_text_is_violation() {
        let err = check_output_contract("{\"status\": \"ok\", \"result\": \"  \"}").unwrap_err();
        assert!(err.contains("empty"));
    }

    #[test]
    fn test_result_preview_bounds_length() {
        let output: Value =
            serde_json::from_str("{\"status\": \"ok\", \"result\": \"abcdefgh\"}").unwrap();
        assert_eq!(result_preview(&output, 4), "abcd");
    }
}
