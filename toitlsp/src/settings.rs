//! Server defaults and per-workspace settings.

use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_REPRO_DIR: &str = "/tmp/lsp_repro";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Defaults configured on the command line; workspace settings override
/// them per connection.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    pub verbose: bool,
    pub default_compiler_path: String,
    pub default_sdk_path: String,
    pub timeout: Option<Duration>,
    /// Surface compiler errors to the caller instead of reporting them to
    /// the client. Used by the CLI.
    pub return_compiler_errors: bool,
}

/// The `toitLanguageServer` configuration section.
#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub verbose: bool,
    pub should_write_repro_on_crash: bool,
    pub timeout: Option<Duration>,
    pub sdk_path: String,
    pub compiler_path: String,
    pub repro_directory: String,
    pub report_package_diagnostics: bool,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        WorkspaceSettings {
            verbose: false,
            should_write_repro_on_crash: false,
            timeout: Some(DEFAULT_TIMEOUT),
            sdk_path: String::new(),
            compiler_path: String::new(),
            repro_directory: DEFAULT_REPRO_DIR.to_string(),
            report_package_diagnostics: false,
        }
    }
}

/// Wire shape of the configuration section.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawWorkspaceSettings {
    verbose: bool,
    should_write_repro_on_crash: bool,
    timeout_ms: Option<u64>,
    sdk_path: String,
    toitc_path: String,
    repro_dir: String,
    report_package_diagnostics: bool,
}

impl RawWorkspaceSettings {
    pub fn into_settings(self) -> WorkspaceSettings {
        let mut res = WorkspaceSettings {
            verbose: self.verbose,
            should_write_repro_on_crash: self.should_write_repro_on_crash,
            sdk_path: self.sdk_path,
            compiler_path: self.toitc_path,
            report_package_diagnostics: self.report_package_diagnostics,
            ..WorkspaceSettings::default()
        };
        if let Some(ms) = self.timeout_ms {
            res.timeout = if ms == 0 {
                None
            } else {
                Some(Duration::from_millis(ms))
            };
        }
        if !self.repro_dir.is_empty() {
            res.repro_directory = self.repro_dir;
        }
        res
    }
}

impl WorkspaceSettings {
    /// Fills gaps with the server-level defaults.
    pub fn merge_defaults(mut self, server: &ServerSettings) -> WorkspaceSettings {
        if self.compiler_path.is_empty() {
            self.compiler_path = server.default_compiler_path.clone();
        }
        if self.sdk_path.is_empty() {
            self.sdk_path = server.default_sdk_path.clone();
        }
        if self.timeout.is_none() {
            self.timeout = server.timeout;
        }
        self.verbose = self.verbose || server.verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_wire_shape() {
        let raw: RawWorkspaceSettings = serde_json::from_str(
            r#"{
                "toitcPath": "/opt/toit/toitc",
                "sdkPath": "/opt/toit/sdk",
                "timeoutMs": 12000,
                "shouldWriteReproOnCrash": true,
                "reproDir": "/tmp/custom",
                "reportPackageDiagnostics": true
            }"#,
        )
        .unwrap();
        let settings = raw.into_settings();
        assert_eq!(settings.compiler_path, "/opt/toit/toitc");
        assert_eq!(settings.timeout, Some(Duration::from_millis(12000)));
        assert!(settings.should_write_repro_on_crash);
        assert_eq!(settings.repro_directory, "/tmp/custom");
        assert!(settings.report_package_diagnostics);
    }

    #[test]
    fn merges_server_defaults_into_gaps() {
        let server = ServerSettings {
            default_compiler_path: "/default/toitc".to_string(),
            default_sdk_path: "/default/sdk".to_string(),
            timeout: Some(Duration::from_secs(9)),
            ..ServerSettings::default()
        };
        let raw = RawWorkspaceSettings {
            sdk_path: "/explicit/sdk".to_string(),
            timeout_ms: None,
            ..RawWorkspaceSettings::default()
        };
        let mut settings = raw.into_settings();
        settings.timeout = None;
        let merged = settings.merge_defaults(&server);
        assert_eq!(merged.compiler_path, "/default/toitc");
        assert_eq!(merged.sdk_path, "/explicit/sdk");
        assert_eq!(merged.timeout, Some(Duration::from_secs(9)));
    }
}
