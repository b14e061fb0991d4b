use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::authz::engine::DEFAULT_TENANT_ATTRIBUTE;
use crate::authz::hierarchy::UnknownTenant;
use crate::authz::planner::PlannerMode;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub policies: Policies,
    pub tenancy: Tenancy,
    pub planner: Planner,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policies {
    /// Directory of `*.kdl` policy files
    pub dir: PathBuf,
    /// Upper bound for one load or reload
    pub load_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenancy {
    pub default_tenant: String,
    /// Principal attribute holding the tenant id
    pub tenant_attribute: String,
    pub unknown_tenant: UnknownTenant,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Planner {
    pub mode: PlannerMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    /// Also emit every record on the `warden::audit` tracing target
    pub trace_records: bool,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("policies"),
            load_timeout_secs: 10,
        }
    }
}

impl Default for Tenancy {
    fn default() -> Self {
        Self {
            default_tenant: "default".to_string(),
            tenant_attribute: DEFAULT_TENANT_ATTRIBUTE.to_string(),
            unknown_tenant: UnknownTenant::Fallback,
        }
    }
}

impl Default for Audit {
    fn default() -> Self {
        Self {
            trace_records: true,
        }
    }
}

impl Policies {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)
            .into_diagnostic()?
            .set_default("server.port", Server::default().port)
            .into_diagnostic()?
            .set_default(
                "policies.dir",
                Policies::default().dir.to_string_lossy().to_string(),
            )
            .into_diagnostic()?
            .set_default(
                "policies.load_timeout_secs",
                Policies::default().load_timeout_secs,
            )
            .into_diagnostic()?
            .set_default("tenancy.default_tenant", Tenancy::default().default_tenant)
            .into_diagnostic()?
            .set_default(
                "tenancy.tenant_attribute",
                Tenancy::default().tenant_attribute,
            )
            .into_diagnostic()?
            .set_default("tenancy.unknown_tenant", "fallback")
            .into_diagnostic()?
            .set_default("planner.mode", "strict")
            .into_diagnostic()?
            .set_default("audit.trace_records", Audit::default().trace_records)
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: WARDEN__SERVER__PORT=9090, etc.
        builder = builder.add_source(config::Environment::with_prefix("WARDEN").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let mut s: Settings = cfg.try_deserialize().into_diagnostic()?;

        // Normalize policies dir to be relative to current dir
        if s.policies.dir.is_relative() {
            s.policies.dir = std::env::current_dir()
                .into_diagnostic()?
                .join(&s.policies.dir);
        }

        Ok(s)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_settings_load_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("nonexistent.toml");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert!(settings.policies.dir.is_absolute());
        assert!(settings.policies.dir.ends_with("policies"));
        assert_eq!(settings.tenancy.default_tenant, "default");
        assert_eq!(settings.tenancy.tenant_attribute, "tenantId");
        assert_eq!(settings.tenancy.unknown_tenant, UnknownTenant::Fallback);
        assert_eq!(settings.planner.mode, PlannerMode::Strict);
    }

    #[test]
    fn test_settings_load_from_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[server]
host = "127.0.0.1"
port = 9090

[policies]
dir = "/etc/warden/policies"

[tenancy]
default_tenant = "root"
tenant_attribute = "orgId"
unknown_tenant = "strict"

[planner]
mode = "narrow"
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.listen_addr(), "127.0.0.1:9090");
        assert_eq!(settings.policies.dir, PathBuf::from("/etc/warden/policies"));
        assert_eq!(settings.tenancy.default_tenant, "root");
        assert_eq!(settings.tenancy.tenant_attribute, "orgId");
        assert_eq!(settings.tenancy.unknown_tenant, UnknownTenant::Strict);
        assert_eq!(settings.planner.mode, PlannerMode::Narrow);
    }

    #[test]
    fn test_settings_env_override() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[policies]
load_timeout_secs = 30

[audit]
trace_records = true
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        env::set_var("WARDEN__POLICIES__LOAD_TIMEOUT_SECS", "3");
        env::set_var("WARDEN__AUDIT__TRACE_RECORDS", "false");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.policies.load_timeout(), Duration::from_secs(3));
        assert!(!settings.audit.trace_records);

        env::remove_var("WARDEN__POLICIES__LOAD_TIMEOUT_SECS");
        env::remove_var("WARDEN__AUDIT__TRACE_RECORDS");
    }
}
