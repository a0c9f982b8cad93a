//! Platform detection.
//!
//! Detects the device OS and CPU architecture and maps them onto the OCI
//! platform names used in manifest lists (`linux/arm64`, `linux/amd64`, ...).

use serde::{Deserialize, Serialize};

/// Platform an image is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Unknown,
}

impl Platform {
    /// Detects the current platform.
    pub fn detect() -> Self {
        Self {
            os: Self::detect_os(),
            arch: Self::detect_arch(),
        }
    }

    /// Builds a platform from explicit parts.
    pub fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    fn detect_os() -> Os {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        return Os::Linux;

        #[cfg(target_os = "macos")]
        return Os::Darwin;

        #[cfg(target_os = "windows")]
        return Os::Windows;

        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "windows"
        )))]
        return Os::Unknown;
    }

    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
        return Arch::Unknown;
    }

    /// OCI `os` value to look for in a manifest list.
    ///
    /// Only Linux images can be extracted into a runnable rootfs, so every
    /// host other than macOS resolves to `linux`.
    pub fn oci_os(&self) -> &'static str {
        match self.os {
            Os::Darwin => "darwin",
            Os::Linux | Os::Windows | Os::Unknown => "linux",
        }
    }

    /// OCI `architecture` value to look for in a manifest list.
    pub fn oci_arch(&self) -> &'static str {
        match self.arch {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Unknown => "amd64",
        }
    }

    /// Returns the OCI platform string (e.g., "linux/amd64").
    pub fn oci_platform(&self) -> String {
        format!("{}/{}", self.oci_os(), self.oci_arch())
    }

    /// True when a manifest-list entry targets this platform.
    pub fn matches(&self, os: &str, architecture: &str) -> bool {
        os == self.oci_os() && architecture == self.oci_arch()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.oci_platform())
    }
}
