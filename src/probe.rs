use std::sync::Arc;

use crate::config::{ConfigResolver, ModelProfile};
use crate::device::{ManualCommand, PlotterDriver, RunRequest};
use crate::messages::{DeviceIdentity, IdentityKind, PowerState, StatusReport};

/// Motor-rail voltage threshold in device-native units; readings at or above
/// this mean the motor supply is plugged in.
const POWER_ON_THRESHOLD: i32 = 250;

/// Current/voltage telemetry query.
const TELEMETRY_QUERY: &str = "QC";

/// Nickname classification table. Order is significant and deliberately
/// preserved: rows are tried top to bottom, substrings left to right, and the
/// first match wins.
const NICKNAME_TABLE: &[(&[&str], &str, u32)] = &[
    (&["mini", "mk"], "AxiDraw MiniKit", 4),
    (&["a3", "se", "large"], "AxiDraw V3/A3 or SE/A3", 2),
    (&["xlx"], "AxiDraw V3 XLX", 3),
    (&["v3", "v2"], "AxiDraw V2, V3, or SE/A4", 1),
    (&["a1"], "AxiDraw SE/A1", 5),
    (&["a2"], "AxiDraw SE/A2", 6),
];

/// Reads device identity and power state without disturbing job execution.
pub struct StatusProbe {
    driver: Arc<dyn PlotterDriver>,
    resolver: Arc<ConfigResolver>,
    default_model: u32,
}

impl StatusProbe {
    pub fn new(
        driver: Arc<dyn PlotterDriver>,
        resolver: Arc<ConfigResolver>,
        default_model: u32,
    ) -> Self {
        Self {
            driver,
            resolver,
            default_model,
        }
    }

    /// Probe the plotter. Must be called while holding the device gate.
    ///
    /// Never fails: every device-side problem degrades the report (`off` or
    /// `connected`) instead of surfacing an error. The session is always
    /// closed and the motors de-energized before this returns.
    pub async fn probe(&self) -> StatusReport {
        let devices = match self.driver.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Device enumeration failed: {}", e);
                return StatusReport::off();
            }
        };

        let Some(label) = devices.first() else {
            return StatusReport::off();
        };

        let identity = classify_label(label, self.default_model);
        tracing::debug!(
            "Classified {:?} as {} (model {:?})",
            identity.raw_label,
            identity.machine,
            identity.model_number
        );

        let profile = match identity.model_number {
            Some(model) => self.resolver.resolve(model).await,
            None => ModelProfile::default(),
        };

        if let Err(e) = self.driver.open().await {
            // A device can enumerate yet fail to open; report what we know.
            tracing::warn!("Plotter enumerated but session open failed: {}", e);
            return StatusReport {
                status: PowerState::Off,
                machine: identity.machine,
                device_info: Some(identity.raw_label),
                model_number: identity.model_number,
                config: profile,
                voltage: None,
            };
        }

        let (status, voltage) = match self.driver.raw_query(TELEMETRY_QUERY).await {
            Ok(reply) => match parse_voltage(&reply) {
                Some(v) if v >= POWER_ON_THRESHOLD => (PowerState::On, Some(v)),
                Some(v) => (PowerState::Connected, Some(v)),
                None => {
                    tracing::warn!("Unparseable telemetry reply {:?}", reply);
                    (PowerState::Connected, None)
                }
            },
            Err(e) => {
                tracing::warn!("Telemetry query failed: {}", e);
                (PowerState::Connected, None)
            }
        };

        // Never leave the device in an ambiguous state behind a probe.
        if let Err(e) = self
            .driver
            .configure_and_run(&RunRequest::Manual(ManualCommand::DisableMotors))
            .await
        {
            tracing::warn!("Failed to disable motors after probe: {}", e);
        }
        if let Err(e) = self.driver.close().await {
            tracing::warn!("Failed to close plotter session after probe: {}", e);
        }

        StatusReport {
            status,
            machine: identity.machine,
            device_info: Some(identity.raw_label),
            model_number: identity.model_number,
            config: profile,
            voltage,
        }
    }
}

/// Interpret one enumerated device label.
///
/// Raw port paths carry no nickname, so they resolve to the configured
/// default model. Anything else is treated as a nickname and matched against
/// the classification table; an unrecognized nickname also falls back to the
/// default model.
pub fn classify_label(label: &str, default_model: u32) -> DeviceIdentity {
    if looks_like_port_path(label) {
        return DeviceIdentity {
            raw_label: label.to_string(),
            kind: IdentityKind::PortPath,
            machine: "unknown, no nickname".to_string(),
            model_number: Some(default_model),
        };
    }

    let lowered = label.to_lowercase();
    for (patterns, machine, model) in NICKNAME_TABLE {
        if patterns.iter().any(|p| lowered.contains(p)) {
            return DeviceIdentity {
                raw_label: label.to_string(),
                kind: IdentityKind::Nickname,
                machine: (*machine).to_string(),
                model_number: Some(*model),
            };
        }
    }

    DeviceIdentity {
        raw_label: label.to_string(),
        kind: IdentityKind::Nickname,
        machine: label.to_string(),
        model_number: Some(default_model),
    }
}

fn looks_like_port_path(label: &str) -> bool {
    if label.contains('/') || label.contains('\\') {
        return true;
    }
    match label.to_ascii_lowercase().strip_prefix("com") {
        Some(rest) => !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// The telemetry reply is comma-separated; the second field is the motor
/// rail voltage in device-native integer units.
pub fn parse_voltage(reply: &str) -> Option<i32> {
    reply.split(',').nth(1)?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDriver;
    use std::collections::HashMap;

    fn probe_with(driver: FakeDriver) -> (StatusProbe, Arc<FakeDriver>) {
        let driver = Arc::new(driver);
        let resolver = Arc::new(ConfigResolver::new(HashMap::new()));
        (
            StatusProbe::new(driver.clone(), resolver, 1),
            driver,
        )
    }

    #[test]
    fn first_matching_substring_wins() {
        // "MiniKitXL" contains both "mini" and "xlx"-adjacent noise; the
        // first table row decides.
        let identity = classify_label("MiniKitXL", 1);
        assert_eq!(identity.model_number, Some(4));
        assert_eq!(identity.machine, "AxiDraw MiniKit");
        assert_eq!(identity.kind, IdentityKind::Nickname);
    }

    #[test]
    fn se_row_shadows_later_rows() {
        // "se" sits in the second row, so an SE/A1 nickname containing "se"
        // resolves to model 2, not model 5. Match order is load-bearing.
        let identity = classify_label("se-a1-studio", 1);
        assert_eq!(identity.model_number, Some(2));
    }

    #[test]
    fn classification_table_rows_resolve() {
        assert_eq!(classify_label("big XLX rig", 1).model_number, Some(3));
        assert_eq!(classify_label("v3-desk", 1).model_number, Some(1));
        assert_eq!(classify_label("studio a1", 1).model_number, Some(5));
        assert_eq!(classify_label("plotter-a2", 1).model_number, Some(6));
    }

    #[test]
    fn port_paths_resolve_to_default_model() {
        for label in ["/dev/ttyACM0", "COM3", "com17", "\\\\.\\COM4"] {
            let identity = classify_label(label, 2);
            assert_eq!(identity.kind, IdentityKind::PortPath, "{label}");
            assert_eq!(identity.model_number, Some(2));
            assert_eq!(identity.machine, "unknown, no nickname");
        }
    }

    #[test]
    fn unmatched_nickname_resolves_to_default_model() {
        let identity = classify_label("office plotter", 6);
        assert_eq!(identity.kind, IdentityKind::Nickname);
        assert_eq!(identity.model_number, Some(6));
    }

    #[test]
    fn comet_is_not_a_com_port() {
        assert!(!looks_like_port_path("comet"));
        assert!(looks_like_port_path("COM12"));
    }

    #[test]
    fn voltage_parsing_matches_contract() {
        assert_eq!(parse_voltage("123,251"), Some(251));
        assert_eq!(parse_voltage("123,100"), Some(100));
        assert_eq!(parse_voltage("garbage"), None);
        assert_eq!(parse_voltage("123,abc"), None);
        assert_eq!(parse_voltage("0255, 0300"), Some(300));
    }

    #[tokio::test]
    async fn no_devices_reports_off() {
        let (probe, driver) = probe_with(FakeDriver::default());
        let report = probe.probe().await;
        assert_eq!(report.status, PowerState::Off);
        assert_eq!(report.machine, "none");
        assert_eq!(report.model_number, None);
        // Nothing beyond enumeration was attempted.
        assert_eq!(driver.calls(), vec!["list"]);
    }

    #[tokio::test]
    async fn enumeration_failure_reports_off() {
        let (probe, _driver) = probe_with(FakeDriver {
            fail_list: true,
            ..Default::default()
        });
        let report = probe.probe().await;
        assert_eq!(report.status, PowerState::Off);
        assert_eq!(report.machine, "none");
    }

    #[tokio::test]
    async fn open_failure_reports_off_but_keeps_identity() {
        let (probe, driver) = probe_with(FakeDriver {
            devices: vec!["MiniKit desk".to_string()],
            fail_open: true,
            ..Default::default()
        });
        let report = probe.probe().await;
        assert_eq!(report.status, PowerState::Off);
        assert_eq!(report.machine, "AxiDraw MiniKit");
        assert_eq!(report.model_number, Some(4));
        assert_eq!(report.device_info.as_deref(), Some("MiniKit desk"));
        // No session was opened, so none is closed.
        assert!(!driver.calls().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn powered_device_reports_on() {
        let (probe, driver) = probe_with(FakeDriver {
            devices: vec!["v3-desk".to_string()],
            query_reply: Some("0120,0301".to_string()),
            ..Default::default()
        });
        let report = probe.probe().await;
        assert_eq!(report.status, PowerState::On);
        assert_eq!(report.voltage, Some(301));
        assert_eq!(
            driver.calls(),
            vec!["list", "open", "query QC", "disable_motors", "close"]
        );
    }

    #[tokio::test]
    async fn unpowered_device_reports_connected() {
        let (probe, _driver) = probe_with(FakeDriver {
            devices: vec!["v3-desk".to_string()],
            query_reply: Some("0120,0080".to_string()),
            ..Default::default()
        });
        let report = probe.probe().await;
        assert_eq!(report.status, PowerState::Connected);
        assert_eq!(report.voltage, Some(80));
    }

    #[tokio::test]
    async fn failed_telemetry_downgrades_to_connected() {
        let (probe, driver) = probe_with(FakeDriver {
            devices: vec!["v3-desk".to_string()],
            query_reply: None,
            ..Default::default()
        });
        let report = probe.probe().await;
        assert_eq!(report.status, PowerState::Connected);
        assert_eq!(report.voltage, None);
        // Probe still cleans up after itself.
        assert!(driver.calls().contains(&"disable_motors".to_string()));
        assert!(driver.calls().contains(&"close".to_string()));
    }
}
