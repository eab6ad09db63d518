//! Minimal blocking client for the Moonraker API on a Klipper host.
//!
//! Only the two queries the flash manager needs: the current print-job
//! state and the component version strings. Every call carries a short
//! timeout; callers treat failures as "oracle unavailable" rather than
//! fatal.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Default Moonraker address on a stock install.
pub const DEFAULT_URL: &str = "http://127.0.0.1:7125";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Client errors.
#[derive(Error, Debug)]
pub enum MoonrakerError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected response shape: missing {0}")]
    Shape(&'static str),
}

/// Print-job state as reported by `print_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Complete,
    Cancelled,
    Error,
    Unknown,
}

impl PrintState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "standby" => Self::Standby,
            "printing" => Self::Printing,
            "paused" => Self::Paused,
            "complete" => Self::Complete,
            "cancelled" => Self::Cancelled,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// A job in flight owns the MCUs; flashing must not proceed.
    pub fn blocks_flashing(self) -> bool {
        matches!(self, Self::Printing | Self::Paused)
    }
}

impl fmt::Display for PrintState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standby => "standby",
            Self::Printing => "printing",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Host and MCU version strings, as far as Moonraker knows them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionReport {
    /// Klipper host software version (from `/printer/info`).
    pub host: Option<String>,
    /// `mcu_version` per Moonraker mcu object (`"mcu"`, `"mcu nhk"`, ...).
    pub mcus: BTreeMap<String, String>,
}

/// Blocking Moonraker client with tight timeouts.
pub struct MoonrakerClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl MoonrakerClient {
    pub fn new(base_url: &str) -> Result<Self, MoonrakerError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn localhost() -> Result<Self, MoonrakerError> {
        Self::new(DEFAULT_URL)
    }

    fn get_json(&self, path: &str) -> Result<Value, MoonrakerError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "moonraker query");
        let response = self.client.get(&url).send()?.error_for_status()?;
        Ok(response.json()?)
    }

    /// Current print-job state.
    pub fn print_state(&self) -> Result<PrintState, MoonrakerError> {
        let json = self.get_json("/printer/objects/query?print_stats")?;
        parse_print_state(&json)
    }

    /// Host and MCU versions. The host version is best-effort inside an
    /// otherwise successful call; MCU objects that do not answer are simply
    /// absent from the map.
    pub fn versions(&self) -> Result<VersionReport, MoonrakerError> {
        let mut report = VersionReport::default();
        if let Ok(info) = self.get_json("/printer/info") {
            report.host = parse_host_version(&info);
        }

        let list = self.get_json("/printer/objects/list")?;
        let names = mcu_object_names(&list)?;
        if names.is_empty() {
            return Ok(report);
        }

        let query: Vec<String> = names.iter().map(|n| n.replace(' ', "%20")).collect();
        let json = self.get_json(&format!("/printer/objects/query?{}", query.join("&")))?;
        report.mcus = parse_mcu_versions(&json, &names);
        Ok(report)
    }
}

/// Dig `print_stats.state` out of an objects-query response.
pub fn parse_print_state(json: &Value) -> Result<PrintState, MoonrakerError> {
    json.pointer("/result/status/print_stats/state")
        .and_then(Value::as_str)
        .map(PrintState::parse)
        .ok_or(MoonrakerError::Shape("print_stats.state"))
}

/// Dig `software_version` out of `/printer/info`.
pub fn parse_host_version(json: &Value) -> Option<String> {
    json.pointer("/result/software_version")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// All `mcu*` object names in an objects-list response.
pub fn mcu_object_names(json: &Value) -> Result<Vec<String>, MoonrakerError> {
    let objects = json
        .pointer("/result/objects")
        .and_then(Value::as_array)
        .ok_or(MoonrakerError::Shape("objects"))?;
    Ok(objects
        .iter()
        .filter_map(Value::as_str)
        .filter(|name| *name == "mcu" || name.starts_with("mcu "))
        .map(str::to_string)
        .collect())
}

/// Collect `mcu_version` for each named object from an objects-query
/// response.
pub fn parse_mcu_versions(json: &Value, names: &[String]) -> BTreeMap<String, String> {
    let mut versions = BTreeMap::new();
    for name in names {
        let pointer = format!("/result/status/{name}/mcu_version");
        if let Some(version) = json.pointer(&pointer).and_then(Value::as_str) {
            versions.insert(name.clone(), version.to_string());
        }
    }
    versions
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn print_state_parses_known_values() {
        for (raw, state, blocks) in [
            ("standby", PrintState::Standby, false),
            ("printing", PrintState::Printing, true),
            ("paused", PrintState::Paused, true),
            ("complete", PrintState::Complete, false),
            ("cancelled", PrintState::Cancelled, false),
            ("error", PrintState::Error, false),
            ("resuming", PrintState::Unknown, false),
        ] {
            let parsed = PrintState::parse(raw);
            assert_eq!(parsed, state);
            assert_eq!(parsed.blocks_flashing(), blocks);
        }
    }

    #[test]
    fn print_state_from_query_response() {
        let json = json!({
            "result": { "status": { "print_stats": { "state": "printing" } } }
        });
        assert_eq!(parse_print_state(&json).unwrap(), PrintState::Printing);
    }

    #[test]
    fn malformed_state_response_is_a_shape_error() {
        let json = json!({ "result": { "status": {} } });
        assert!(matches!(
            parse_print_state(&json),
            Err(MoonrakerError::Shape(_))
        ));
    }

    #[test]
    fn host_version_from_printer_info() {
        let json = json!({
            "result": { "state": "ready", "software_version": "v0.12.0-89-gead81fbf" }
        });
        assert_eq!(
            parse_host_version(&json).as_deref(),
            Some("v0.12.0-89-gead81fbf")
        );
        assert_eq!(parse_host_version(&json!({"result": {}})), None);
    }

    #[test]
    fn mcu_objects_are_filtered_from_the_list() {
        let json = json!({
            "result": { "objects": ["webhooks", "mcu", "mcu nhk36", "mcu_temps", "heater_bed"] }
        });
        assert_eq!(
            mcu_object_names(&json).unwrap(),
            vec!["mcu".to_string(), "mcu nhk36".to_string()]
        );
    }

    #[test]
    fn mcu_versions_collected_per_object() {
        let names = vec!["mcu".to_string(), "mcu nhk36".to_string()];
        let json = json!({
            "result": { "status": {
                "mcu": { "mcu_version": "v0.12.0-89-gead81fbf" },
                "mcu nhk36": { "mcu_version": "v0.12.0-85-g40b95cbd" }
            } }
        });
        let versions = parse_mcu_versions(&json, &names);
        assert_eq!(versions["mcu"], "v0.12.0-89-gead81fbf");
        assert_eq!(versions["mcu nhk36"], "v0.12.0-85-g40b95cbd");
    }

    #[test]
    fn missing_mcu_entries_are_skipped() {
        let names = vec!["mcu".to_string(), "mcu ebb36".to_string()];
        let json = json!({
            "result": { "status": { "mcu": { "mcu_version": "v0.12.0" } } }
        });
        let versions = parse_mcu_versions(&json, &names);
        assert_eq!(versions.len(), 1);
        assert!(!versions.contains_key("mcu ebb36"));
    }
}
