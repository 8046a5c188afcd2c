// src/boot_service.rs
//
// Boot-time persistence: a shell script replaying the applied settings,
// started by a oneshot systemd unit.

use anyhow::{bail, Context, Result};
use log::{info, warn};

use std::fs;
use std::path::{Path, PathBuf};

use crate::commands::CommandBuilder;
use crate::globals::{
    SCRIPT_INSTALL_PATH, SCRIPT_STAGING_PATH, SERVICE_INSTALL_PATH, SERVICE_NAME,
    SERVICE_STAGING_PATH,
};
use crate::ledger::AppliedSettings;

/// Build the replay script. Output depends only on `settings` and the
/// resolved files, so two runs over the same state are byte-identical.
pub fn generate_script(settings: &AppliedSettings, builder: &CommandBuilder<'_>) -> Result<String> {
    let mut lines = vec!["#!/bin/bash".to_string()];

    for action in settings.actions(builder.vendor()) {
        match builder.build(&action) {
            Ok(plan) => lines.extend(plan.commands),
            Err(e) => warn!("Leaving {} out of the boot script: {}", action.kind(), e),
        }
    }

    if lines.len() == 1 {
        bail!("No applied settings to run at boot");
    }

    Ok(lines.join("\n"))
}

pub fn unit_file() -> String {
    format!(
        "[Unit]\n\
         Description=Apply ClockSpeeds settings\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart={}\n\
         TimeoutSec=0\n\
         RemainAfterExit=yes\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        SCRIPT_INSTALL_PATH
    )
}

/// Where the two files are written before the privileged move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPaths {
    pub script: PathBuf,
    pub unit: PathBuf,
}

impl Default for StagingPaths {
    fn default() -> Self {
        Self {
            script: PathBuf::from(SCRIPT_STAGING_PATH),
            unit: PathBuf::from(SERVICE_STAGING_PATH),
        }
    }
}

pub fn write_staging(script: &str, staging: &StagingPaths) -> Result<()> {
    write_file(&staging.unit, &unit_file())?;
    write_file(&staging.script, script)?;
    info!(
        "Staged boot files at {} and {}",
        staging.unit.display(),
        staging.script.display()
    );
    Ok(())
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

/// Move the staged files into place, then enable and start the unit.
pub fn install_command(staging: &StagingPaths) -> String {
    [
        format!("mv {} {}", staging.unit.display(), SERVICE_INSTALL_PATH),
        format!("mv {} {}", staging.script.display(), SCRIPT_INSTALL_PATH),
        format!("chmod +x {}", SCRIPT_INSTALL_PATH),
        "systemctl daemon-reload".to_string(),
        format!("systemctl enable {}", SERVICE_NAME),
        format!("systemctl start {}", SERVICE_NAME),
    ]
    .join(" && ")
}

pub fn remove_command() -> String {
    [
        format!("rm {}", SCRIPT_INSTALL_PATH),
        format!("systemctl stop {}", SERVICE_NAME),
        format!("systemctl disable {}", SERVICE_NAME),
        format!("rm {}", SERVICE_INSTALL_PATH),
        "systemctl daemon-reload".to_string(),
    ]
    .join(" && ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Limits, PendingAction};
    use crate::fixtures::FakeHost;
    use crate::locator::Vendor;

    #[test]
    fn test_unit_file_exact() {
        let expected = "[Unit]\nDescription=Apply ClockSpeeds settings\n\n[Service]\nType=oneshot\n\
            ExecStart=/usr/local/bin/apply_clockspeeds_settings.sh\nTimeoutSec=0\nRemainAfterExit=yes\n\n\
            [Install]\nWantedBy=multi-user.target\n";
        assert_eq!(unit_file(), expected);
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            install_command(&StagingPaths::default()),
            "mv /tmp/clockspeeds.service /etc/systemd/system/clockspeeds.service && \
             mv /tmp/apply_clockspeeds_settings.sh /usr/local/bin/apply_clockspeeds_settings.sh && \
             chmod +x /usr/local/bin/apply_clockspeeds_settings.sh && systemctl daemon-reload && \
             systemctl enable clockspeeds.service && systemctl start clockspeeds.service"
        );
        assert_eq!(
            remove_command(),
            "rm /usr/local/bin/apply_clockspeeds_settings.sh && systemctl stop clockspeeds.service && \
             systemctl disable clockspeeds.service && rm /etc/systemd/system/clockspeeds.service && \
             systemctl daemon-reload"
        );
    }

    #[test]
    fn test_script_is_deterministic_and_ordered() {
        let host = FakeHost::intel(2);
        let table = host.table();
        let builder = CommandBuilder::new(&table, 1, None, Limits::default());

        let mut settings = AppliedSettings::default();
        settings.record(&PendingAction::EnergyPerfBias(4), Vendor::Intel);
        settings.record(&PendingAction::Governor("performance".into()), Vendor::Intel);
        settings.record(&PendingAction::uniform_limits([0, 1], 800, 3000), Vendor::Intel);

        let first = generate_script(&settings, &builder).unwrap();
        let second = generate_script(&settings, &builder).unwrap();
        assert_eq!(first, second);

        let lines: Vec<&str> = first.lines().collect();
        assert_eq!(lines[0], "#!/bin/bash");
        assert_eq!(lines.len(), 1 + 4 + 2 + 2);
        assert!(lines[1].contains("scaling_max_freq"));
        assert!(lines[5].starts_with("echo performance"));
        assert!(lines[8].starts_with("echo 4 | tee"));
    }

    #[test]
    fn test_empty_settings_refused() {
        let host = FakeHost::amd(2);
        let table = host.table();
        let builder = CommandBuilder::new(&table, 1, None, Limits::default());
        assert!(generate_script(&AppliedSettings::default(), &builder).is_err());

        // TDP without the SMU driver is skipped, leaving nothing
        let mut settings = AppliedSettings::default();
        settings.record(&PendingAction::Tdp { watts: 65.0 }, Vendor::Other);
        assert!(generate_script(&settings, &builder).is_err());
    }

    #[test]
    fn test_write_staging() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingPaths {
            script: dir.path().join("apply.sh"),
            unit: dir.path().join("unit.service"),
        };
        write_staging("#!/bin/bash\ntrue\n", &staging).unwrap();
        assert_eq!(fs::read_to_string(&staging.unit).unwrap(), unit_file());
        assert_eq!(fs::read_to_string(&staging.script).unwrap(), "#!/bin/bash\ntrue\n");
        assert!(install_command(&staging).contains(&format!("mv {} ", staging.script.display())));
    }
}
