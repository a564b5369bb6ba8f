//! Built-in vendor CLI profiles.
//!
//! A profile bundles the prompt state machine of a vendor CLI with the
//! commands the shell driver needs around it: how to turn paging off, which
//! mode configuration lines go into, and how running configuration is saved
//! to startup.

use crate::error::ConnectError;
use crate::prompt::{Answer, PromptHandler};

/// Names accepted in [`Device::platform`](crate::model::Device::platform).
pub const BUILTIN_PLATFORMS: &[&str] = &["cisco", "huawei", "h3c"];

/// Dynamic parameter key holding the enable secret.
pub const ENABLE_SECRET_PARAM: &str = "enable_secret";

/// Everything the CLI driver needs to know about a vendor.
#[derive(Debug, Clone)]
pub struct CliProfile {
    pub name: &'static str,
    pub handler: PromptHandler,
    /// Sent once after login to stop pagination.
    pub disable_paging: Option<&'static str>,
    /// Mode plain commands run in.
    pub exec_mode: &'static str,
    /// Mode configuration lines are applied in.
    pub config_mode: &'static str,
    /// Persists running configuration to startup.
    pub save_command: &'static str,
    /// Lightweight command used by connection tests.
    pub probe_command: &'static str,
    /// Prints the running configuration.
    pub running_config_command: &'static str,
}

/// Returns a profile by name (case-insensitive).
pub fn by_name(name: &str) -> Result<CliProfile, ConnectError> {
    match name.to_ascii_lowercase().as_str() {
        "cisco" | "cisco_ios" | "ios" => cisco(),
        "huawei" | "vrp" => huawei(),
        "h3c" | "comware" => h3c(),
        other => Err(ConnectError::UnsupportedTransport(format!(
            "no CLI profile for platform '{other}'"
        ))),
    }
}

/// Cisco IOS / IOS-XE.
pub fn cisco() -> Result<CliProfile, ConnectError> {
    let handler = PromptHandler::builder()
        .prompt("Config", &[r"^[^\s#]+\(conf[^)]*\)#\s*$"])
        .prompt("Enable", &[r"^[^\s#(]+#\s*$"])
        .prompt("Login", &[r"^[^\s>]+>\s*$"])
        .input(
            "EnablePassword",
            Answer::Param(ENABLE_SECRET_PARAM.to_string()),
            &[r"^\x00*\r?(Enable )?[Pp]assword:\s*$"],
        )
        .input(
            "Confirm",
            Answer::Static("\n".to_string()),
            &[r"Destination filename \[.+\]\?\s*$", r"\[confirm\]\s*$"],
        )
        .more(&[r"\s*--More--\s*"])
        .errors(&[
            r"^% Invalid input detected at '\^' marker\.",
            r"^% Incomplete command\.",
            r"^% Ambiguous command:.*",
            r"^% Unknown command.*",
            r"^Command authorization failed.*",
            r"^Command rejected:.*",
            r"^%\s*Error.*",
        ])
        .edge("Login", "enable", "Enable")
        .edge("Enable", "configure terminal", "Config")
        .edge("Config", "end", "Enable")
        .build()?;

    Ok(CliProfile {
        name: "cisco",
        handler,
        disable_paging: Some("terminal length 0"),
        exec_mode: "enable",
        config_mode: "config",
        save_command: "copy running-config startup-config",
        probe_command: "show version",
        running_config_command: "show running-config",
    })
}

/// Huawei VRP.
pub fn huawei() -> Result<CliProfile, ConnectError> {
    let handler = PromptHandler::builder()
        .prompt("Config", &[r"^(HRP_M|HRP_S)?\[.+\]\s*$"])
        .prompt("Enable", &[r"^(RBM_P|RBM_S)?<.+>\s*$"])
        .input(
            "Save",
            Answer::Static("y\n".to_string()),
            &[
                r"Are you sure to continue\?\s*\[Y/N\]:?\s*$",
                r"Continue\?\s*\[Y/N\]:?\s*$",
            ],
        )
        .more(&[r"\s*---- More ----\s*"])
        .errors(&[r"^Error: .+$", r"^\s*\^$"])
        .ignore_errors(&[r"Error: The delete configuration does not exist\."])
        .edge("Enable", "system-view", "Config")
        .edge("Config", "return", "Enable")
        .build()?;

    Ok(CliProfile {
        name: "huawei",
        handler,
        disable_paging: Some("screen-length 0 temporary"),
        exec_mode: "enable",
        config_mode: "config",
        save_command: "save",
        probe_command: "display version",
        running_config_command: "display current-configuration",
    })
}

/// H3C Comware.
pub fn h3c() -> Result<CliProfile, ConnectError> {
    let handler = PromptHandler::builder()
        .prompt("Config", &[r"^(RBM_P|RBM_S)?\[.+\]\s*$"])
        .prompt("Enable", &[r"^(RBM_P|RBM_S)?<.+>\s*$"])
        .input(
            "Save",
            Answer::Static("y\n".to_string()),
            &[
                r"Are you sure\?\s*\[Y/N\]:?\s*$",
                r"press the enter key\):?\s*$",
                r"overwrite\?\s*\[Y/N\]:?\s*$",
            ],
        )
        .more(&[r"\s*---- More ----\s*"])
        .errors(&[r".+\^.+", r"^\s*% .+", r".+does not exist.+"])
        .edge("Enable", "system-view", "Config")
        .edge("Config", "return", "Enable")
        .build()?;

    Ok(CliProfile {
        name: "h3c",
        handler,
        disable_paging: Some("screen-length disable"),
        exec_mode: "enable",
        config_mode: "config",
        save_command: "save force",
        probe_command: "display version",
        running_config_command: "display current-configuration",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_profile_builds() {
        for name in BUILTIN_PLATFORMS {
            let profile = by_name(name).expect("builtin profile");
            assert_eq!(profile.name, *name);
            assert!(profile.handler.has_state(profile.config_mode));
            assert!(profile.handler.has_state(profile.exec_mode));
        }
    }

    #[test]
    fn unknown_platform_is_unsupported() {
        let err = by_name("junos").unwrap_err();
        assert!(matches!(err, ConnectError::UnsupportedTransport(_)));
    }

    #[test]
    fn cisco_prompts_are_classified() {
        let profile = cisco().expect("cisco");
        let mut handler = profile.handler;
        handler.read("R1(config)#");
        assert_eq!(handler.current_state(), "config");
        handler.read("R1(config-if)#");
        assert_eq!(handler.current_state(), "config");
        handler.read("R1#");
        assert_eq!(handler.current_state(), "enable");
        handler.read("R1>");
        assert_eq!(handler.current_state(), "login");
    }

    #[test]
    fn cisco_rejections_are_errors() {
        let profile = cisco().expect("cisco");
        assert!(profile.handler.is_error("% Invalid input detected at '^' marker."));
        assert!(profile.handler.is_error("% Incomplete command."));
        assert!(!profile.handler.is_error("Cisco IOS Software, Version 15.1"));
    }

    #[test]
    fn cisco_config_path_from_login() {
        let mut handler = cisco().expect("cisco").handler;
        handler.read("R1>");
        let path = handler.path_to("config").expect("path");
        let commands: Vec<_> = path.iter().map(|(cmd, _)| cmd.as_str()).collect();
        assert_eq!(commands, vec!["enable", "configure terminal"]);
    }

    #[test]
    fn huawei_modes_use_system_view() {
        let mut handler = huawei().expect("huawei").handler;
        handler.read("<HUAWEI>");
        assert_eq!(handler.current_state(), "enable");
        let path = handler.path_to("config").expect("path");
        assert_eq!(path[0].0, "system-view");
        handler.read("[HUAWEI]");
        assert_eq!(handler.current_state(), "config");
    }

    #[test]
    fn huawei_save_confirmation_is_answered() {
        let handler = huawei().expect("huawei").handler;
        assert_eq!(
            handler.answer_for("Are you sure to continue?[Y/N]:"),
            Some("y\n".to_string())
        );
    }
}
