use std::collections::BTreeMap;

use crate::{
    error::ScanError,
    models::{OptionValue, ScanJob, ScanPreset, ToolKind},
};

/// Tool binaries and the knobs the builder needs from configuration.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub nmap_path: String,
    pub whatweb_path: String,
    pub nmap_timing: u8,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            nmap_path: "nmap".to_string(),
            whatweb_path: "whatweb".to_string(),
            nmap_timing: 3,
        }
    }
}

/// A fully resolved process invocation. Arguments are never joined for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Space-joined form kept on the record for audit.
    pub fn command_line(&self) -> String {
        self.argv().join(" ")
    }
}

pub struct NmapAdapter;

impl NmapAdapter {
    fn preset_switches(preset: ScanPreset) -> &'static [&'static str] {
        match preset {
            ScanPreset::Basic => &["-sS", "-sV", "-O"],
            ScanPreset::Stealth => &["-sS", "-sV", "-O", "--script=vuln"],
            ScanPreset::Aggressive => &["-sS", "-sV", "-O", "-A", "--script=vuln"],
            ScanPreset::PortScan => &["-sS", "-sV"],
            ScanPreset::Custom => &[],
        }
    }

    pub fn args(&self, job: &ScanJob, target: &str, settings: &ToolSettings) -> Vec<String> {
        let mut args = vec![
            format!("-T{}", settings.nmap_timing.min(5)),
            "-oX".to_string(),
            "-".to_string(),
        ];
        args.extend(
            Self::preset_switches(job.preset)
                .iter()
                .map(|s| s.to_string()),
        );

        match job.ports.as_deref().map(str::trim) {
            Some(ports) if !ports.is_empty() => {
                args.push("-p".to_string());
                args.push(ports.to_string());
            }
            _ => args.push("-p-".to_string()),
        }

        push_options(&mut args, &job.options);
        args.push(target.to_string());
        args
    }
}

pub struct WhatWebAdapter;

impl WhatWebAdapter {
    pub fn args(&self, job: &ScanJob, target: &str) -> Vec<String> {
        let mut args = vec!["--no-errors".to_string(), target.to_string()];
        push_options(&mut args, &job.options);
        args
    }
}

/// Build the argument vector for `job`. Pure; rejects malformed jobs.
pub fn build_invocation(job: &ScanJob, settings: &ToolSettings) -> Result<Invocation, ScanError> {
    let target = job.target.trim();
    if target.is_empty() {
        return Err(ScanError::InvalidInput("target cannot be empty".to_string()));
    }
    if let Some(key) = job.options.keys().find(|k| k.trim().is_empty()) {
        return Err(ScanError::InvalidInput(format!(
            "option key cannot be blank (got {key:?})"
        )));
    }

    let invocation = match job.tool {
        ToolKind::PortScan => {
            if let Some(ports) = job.ports.as_deref() {
                if !ports.chars().any(|c| c.is_ascii_digit()) {
                    return Err(ScanError::InvalidInput(format!(
                        "ports must contain numbers (got {ports:?})"
                    )));
                }
            }
            Invocation {
                program: settings.nmap_path.clone(),
                args: NmapAdapter.args(job, target, settings),
            }
        }
        ToolKind::Fingerprint => Invocation {
            program: settings.whatweb_path.clone(),
            args: WhatWebAdapter.args(job, target),
        },
    };
    Ok(invocation)
}

// `--long` keys bind with `=`, anything else is followed by its value.
fn push_options(args: &mut Vec<String>, options: &BTreeMap<String, OptionValue>) {
    for (key, value) in options {
        match value {
            OptionValue::Flag(false) => {}
            OptionValue::Flag(true) => args.push(key.clone()),
            OptionValue::Text(text) if key.starts_with("--") => {
                args.push(format!("{key}={text}"));
            }
            OptionValue::Text(text) => {
                args.push(key.clone());
                if !text.is_empty() {
                    args.push(text.clone());
                }
            }
        }
    }
}
