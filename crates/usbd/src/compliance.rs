//! Charger compliance warning parsing
//!
//! The TCPC driver reports non-compliance reasons as a bracketed list, e.g.
//! `"[bc12], [missing_rp]"`. Tokens are matched by prefix.

use crate::types::ComplianceWarning;

const DEBUG_ACCESSORY: &str = "debug-accessory";
const BC12: &str = "bc12";
const MISSING_RP: &str = "missing_rp";
const OTHER: &str = "other";
const INPUT_POWER_LIMITED: &str = "input_power_limited";

fn is_delimiter(c: char) -> bool {
    matches!(c, '[' | ']' | ',' | ' ' | '\n' | '\0')
}

/// Parses a `non_compliant_reasons` node into a warning set.
///
/// `other` and `input_power_limited` collapse to one kind: OTHER, or
/// INPUT_POWER_LIMITED when `split_input_power_limited` is set.
/// Unknown tokens are ignored and duplicates are dropped.
pub fn parse_compliance_warnings(
    raw: &str,
    split_input_power_limited: bool,
) -> Vec<ComplianceWarning> {
    let mut warnings = Vec::new();

    for token in raw.split(is_delimiter).filter(|t| !t.is_empty()) {
        let warning = if token.starts_with(DEBUG_ACCESSORY) {
            ComplianceWarning::DebugAccessory
        } else if token.starts_with(BC12) {
            ComplianceWarning::Bc12
        } else if token.starts_with(MISSING_RP) {
            ComplianceWarning::MissingRp
        } else if token.starts_with(OTHER) || token.starts_with(INPUT_POWER_LIMITED) {
            if split_input_power_limited {
                ComplianceWarning::InputPowerLimited
            } else {
                ComplianceWarning::Other
            }
        } else {
            continue;
        };

        if !warnings.contains(&warning) {
            warnings.push(warning);
        }
    }

    warnings
}
