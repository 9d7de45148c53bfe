//! Agent install one-liners.

use std::fmt;
use std::str::FromStr;

use fleet_core::Labels;
use serde::{Deserialize, Serialize};

use crate::{ApiError, ApiResult};

const RELEASES: &str = "https://github.com/observIQ/observiq-otel-collector/releases";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    LinuxAmd64,
    LinuxArm64,
    LinuxArm,
    DarwinAmd64,
    DarwinArm64,
    WindowsAmd64,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::LinuxAmd64,
        Platform::LinuxArm64,
        Platform::LinuxArm,
        Platform::DarwinAmd64,
        Platform::DarwinArm64,
        Platform::WindowsAmd64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::LinuxAmd64 => "linux-amd64",
            Platform::LinuxArm64 => "linux-arm64",
            Platform::LinuxArm => "linux-arm",
            Platform::DarwinAmd64 => "darwin-amd64",
            Platform::DarwinArm64 => "darwin-arm64",
            Platform::WindowsAmd64 => "windows-amd64",
        }
    }

    fn os(&self) -> &'static str {
        match self {
            Platform::LinuxAmd64 | Platform::LinuxArm64 | Platform::LinuxArm => "linux",
            Platform::DarwinAmd64 | Platform::DarwinArm64 => "darwin",
            Platform::WindowsAmd64 => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Platform {
    type Err = ApiError;

    /// Accepts the canonical names plus the bare os and `macos` aliases. Bare names pick amd64.
    fn from_str(s: &str) -> ApiResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" | "linux-amd64" => Ok(Platform::LinuxAmd64),
            "linux-arm64" => Ok(Platform::LinuxArm64),
            "linux-arm" => Ok(Platform::LinuxArm),
            "darwin" | "macos" | "darwin-amd64" | "macos-amd64" => Ok(Platform::DarwinAmd64),
            "darwin-arm64" | "macos-arm64" => Ok(Platform::DarwinArm64),
            "windows" | "windows-amd64" => Ok(Platform::WindowsAmd64),
            other => Err(ApiError::Invalid(format!("unknown platform '{}'", other))),
        }
    }
}

/// Inputs of an install command. An empty version installs the latest release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallParams {
    pub platform: String,
    #[serde(default)]
    pub version: String,
    pub endpoint: String,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub labels: Labels,
}

fn download_url(version: &str, file: &str) -> String {
    if version.is_empty() || version == "latest" {
        format!("{}/latest/download/{}", RELEASES, file)
    } else {
        format!("{}/download/v{}/{}", RELEASES, version.trim_start_matches('v'), file)
    }
}

/// One-line installer for `params.platform`.
pub fn install_command(params: &InstallParams) -> ApiResult<String> {
    let platform: Platform = params.platform.parse()?;
    if params.endpoint.trim().is_empty() {
        return Err(ApiError::Invalid("endpoint is required".into()));
    }
    let labels = params.labels.custom().to_string();
    let secret = params.secret_key.as_deref().filter(|s| !s.is_empty());

    if platform.os() == "windows" {
        let mut cmd = format!(
            r#"msiexec /i "{}" /quiet OPAMP_ENDPOINT="{}""#,
            download_url(&params.version, "observiq-otel-collector.msi"),
            params.endpoint
        );
        if let Some(s) = secret {
            cmd.push_str(&format!(r#" OPAMP_SECRET_KEY="{}""#, s));
        }
        if !labels.is_empty() {
            cmd.push_str(&format!(r#" OPAMP_LABELS="{}""#, labels));
        }
        return Ok(cmd);
    }

    let script = if platform.os() == "darwin" { "install_macos.sh" } else { "install_unix.sh" };
    let mut cmd = format!(
        r#"sudo sh -c "$(curl -fsSlL {})" {} -e {}"#,
        download_url(&params.version, script),
        script,
        params.endpoint
    );
    if let Some(s) = secret {
        cmd.push_str(&format!(" -s {}", s));
    }
    if !params.version.is_empty() && params.version != "latest" {
        cmd.push_str(&format!(" -v {}", params.version.trim_start_matches('v')));
    }
    if !labels.is_empty() {
        cmd.push_str(&format!(r#" -k "{}""#, labels));
    }
    Ok(cmd)
}
