use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, anyhow};

/// Launches the platform install procedure as a detached process.
///
/// The invoker only reports whether the launch itself succeeded; it never
/// waits for installation to finish, since the installer typically replaces
/// the running binary after the host application exits.
#[derive(Debug, Clone)]
pub struct InstallInvoker {
    command: String,
    args: Vec<String>,
}

impl InstallInvoker {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Launch the installer with the package path and a required/optional
    /// flag appended to the configured arguments
    pub fn invoke(&self, package_path: &Path, required: bool) -> Result<()> {
        if self.command.is_empty() {
            return Err(anyhow!("no install command configured"));
        }

        let flag = if required { "required" } else { "optional" };
        log::info!(
            "[InstallInvoker] Launching {} {:?} {:?} {}",
            self.command,
            self.args,
            package_path,
            flag
        );

        let child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .arg(package_path)
            .arg(flag)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .with_context(|| format!("failed to launch installer: {}", self.command))?;

        log::info!(
            "[InstallInvoker] Installer launched (pid {:?})",
            child.id()
        );
        Ok(())
    }
}
