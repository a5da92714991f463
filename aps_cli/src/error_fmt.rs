//! Human-readable error descriptions and structured JSON error formatting.

use aps_core::error::{ApsError, BuildError};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingProfile => {
                "What happened: No profile was provided to the cycle.\nLikely causes: The configuration could not be turned into a profile.\nHow to fix: Run `aps self-check` and fix the reported section.".to_string()
            }
            BuildError::MissingGlucose => {
                "What happened: No glucose readings were provided.\nLikely causes: The --glucose flag was not passed.\nHow to fix: Pass a JSON array of readings via --glucose <FILE>.".to_string()
            }
            BuildError::MissingClock => {
                "What happened: No clock was configured for the cycle.\nLikely causes: Internal wiring error.\nHow to fix: Re-run with --log-level=debug and report the output.".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid cycle input ({msg}).\nLikely causes: A negative or non-numeric value on the command line or in an input file.\nHow to fix: Correct the value and rerun."
            ),
        };
    }

    if let Some(ae) = err.downcast_ref::<ApsError>() {
        return match ae {
            ApsError::Config(msg) => format!(
                "What happened: The configuration is invalid: {msg}.\nLikely causes: A missing or out-of-range value in the TOML or basal CSV.\nHow to fix: Edit the config file and run `aps self-check`. No dose was enacted."
            ),
            ApsError::InvalidInput(msg) => format!(
                "What happened: An input could not be used: {msg}.\nLikely causes: Malformed JSON, a negative amount, or a wrong field name.\nHow to fix: Check the named file against the expected schema."
            ),
            ApsError::Ledger(msg) => format!(
                "What happened: The pending-dose ledger rejected the operation: {msg}.\nLikely causes: A duplicate dose, or resolving a dose that is not uncertain.\nHow to fix: Inspect the ledger file; the previous state was left unchanged."
            ),
            ApsError::UnknownDose(uuid) => format!(
                "What happened: Dose {uuid} is not in the ledger.\nLikely causes: It was already drained or the wrong ledger file was passed.\nHow to fix: List the ledger contents and retry with a pending uuid."
            ),
            ApsError::Io(msg) => format!(
                "What happened: File access failed: {msg}.\nLikely causes: Wrong path or missing permissions.\nHow to fix: Check the path and rerun."
            ),
        };
    }

    // Generic fallback
    let msg = err.to_string();
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes: config 3, invalid input 4, ledger 5, anything else 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if err.downcast_ref::<BuildError>().is_some() {
        return 4;
    }
    match err.downcast_ref::<ApsError>() {
        Some(ApsError::Config(_)) => 3,
        Some(ApsError::InvalidInput(_)) => 4,
        Some(ApsError::Ledger(_) | ApsError::UnknownDose(_)) => 5,
        _ => 1,
    }
}

fn reason_name(err: &eyre::Report) -> &'static str {
    if err.downcast_ref::<BuildError>().is_some() {
        return "InvalidInput";
    }
    match err.downcast_ref::<ApsError>() {
        Some(ApsError::Config(_)) => "Config",
        Some(ApsError::InvalidInput(_)) => "InvalidInput",
        Some(ApsError::Ledger(_)) => "Ledger",
        Some(ApsError::UnknownDose(_)) => "UnknownDose",
        Some(ApsError::Io(_)) => "Io",
        None => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let mut obj = json!({
        "reason": reason_name(err),
        "exit_code": exit_code_for_error(err),
        "message": humanize(err),
    });
    if let Some(ApsError::UnknownDose(uuid)) = err.downcast_ref::<ApsError>() {
        obj["details"] = json!({ "uuid": uuid });
    }
    obj.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        let cfg = eyre::Report::new(ApsError::Config("profile.sens must be > 0".into()));
        let input = eyre::Report::new(ApsError::InvalidInput("bad".into()));
        let ledger = eyre::Report::new(ApsError::UnknownDose(uuid::Uuid::nil()));
        let other = eyre::eyre!("boom");
        assert_eq!(exit_code_for_error(&cfg), 3);
        assert_eq!(exit_code_for_error(&input), 4);
        assert_eq!(exit_code_for_error(&ledger), 5);
        assert_eq!(exit_code_for_error(&other), 1);
    }

    #[test]
    fn json_error_names_the_reason() {
        let err = eyre::Report::new(ApsError::Ledger("dose appears twice".into()));
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["reason"], "Ledger");
        assert_eq!(v["exit_code"], 5);
        assert!(v["message"].as_str().unwrap().contains("What happened"));
    }
}
