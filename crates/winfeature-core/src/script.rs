//! Script parameterization and the fixed remote command lines
//!
//! Paths, command lines and exit codes in this module are shared with the
//! PowerShell scripts under `scripts/` and must not change independently.

use std::fmt::Write as _;

use base64::Engine;
use thiserror::Error;
use uuid::Uuid;

/// Elevated wrapper that runs the install command
pub const ELEVATED_PATH: &str = "C:/Windows/Temp/packer-windows-feature-elevated.ps1";
pub const ELEVATED_COMMAND: &str = "PowerShell -ExecutionPolicy Bypass -OutputFormat Text -File C:/Windows/Temp/packer-windows-feature-elevated.ps1";

/// Feature/capability installation payload
pub const WINDOWS_FEATURE_PATH: &str = "C:/Windows/Temp/packer-windows-feature.ps1";

/// Elevated wrapper that only checks whether a reboot is pending
pub const PENDING_REBOOT_ELEVATED_PATH: &str =
    "C:/Windows/Temp/packer-windows-feature-pending-reboot-elevated.ps1";
pub const PENDING_REBOOT_ELEVATED_COMMAND: &str = "PowerShell -ExecutionPolicy Bypass -OutputFormat Text -File C:/Windows/Temp/packer-windows-feature-pending-reboot-elevated.ps1";

pub const RESTART_COMMAND: &str = "shutdown.exe -f -r -t 0 -c \"packer restart\"";
pub const TEST_RESTART_COMMAND: &str = "shutdown.exe -f -r -t 60 -c \"packer restart test\"";
pub const ABORT_TEST_RESTART_COMMAND: &str = "shutdown.exe -a";

const INSTALL_TASK_DESCRIPTION: &str = "Packer Windows update elevated task";
const PENDING_REBOOT_TASK_DESCRIPTION: &str = "Packer Windows feature pending reboot elevated task";

const POWERSHELL_PREFIX: &str = "PowerShell -ExecutionPolicy Bypass -OutputFormat Text";

/// Placeholders the elevated template may use
pub const ELEVATED_PARAMETERS: [&str; 5] = [
    "Username",
    "Password",
    "TaskName",
    "TaskDescription",
    "Command",
];

/// Errors in a script template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// `{{` without a matching `}}`
    #[error("unterminated placeholder at byte {offset}")]
    Unterminated { offset: usize },

    /// Placeholder with an empty or malformed name
    #[error("invalid placeholder name {name:?} at byte {offset}")]
    InvalidName { name: String, offset: usize },

    /// Placeholder not in the parameter set
    #[error("unknown placeholder {name:?}")]
    UnknownParameter { name: String },
}

/// Parse a template into literal text and placeholder names
fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut consumed = 0;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Text(&rest[..open]));
        }
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or(TemplateError::Unterminated {
                offset: consumed + open,
            })?;

        let name = after_open[..close].trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(TemplateError::InvalidName {
                name: name.to_string(),
                offset: consumed + open,
            });
        }
        segments.push(Segment::Placeholder(name));

        let advance = open + 2 + close + 2;
        consumed += advance;
        rest = &rest[advance..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }

    Ok(segments)
}

enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Substitute `{{Name}}` placeholders with values from `params`.
///
/// Values are inserted verbatim. Fails only on malformed templates.
///
/// # Errors
/// Returns `TemplateError` for unterminated or malformed placeholders and for
/// names missing from `params`.
pub fn render(template: &str, params: &[(&str, &str)]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());

    for segment in parse(template)? {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Placeholder(name) => {
                let (_, value) = params.iter().find(|(key, _)| *key == name).ok_or_else(|| {
                    TemplateError::UnknownParameter {
                        name: name.to_string(),
                    }
                })?;
                out.push_str(value);
            }
        }
    }

    Ok(out)
}

/// Check that a template only uses the given placeholder names
///
/// # Errors
/// Returns the first problem found in the template.
pub fn validate(template: &str, allowed: &[&str]) -> Result<(), TemplateError> {
    for segment in parse(template)? {
        if let Segment::Placeholder(name) = segment
            && !allowed.contains(&name)
        {
            return Err(TemplateError::UnknownParameter {
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Templates and payload handed to the provisioner at construction
#[derive(Debug, Clone)]
pub struct ScriptTemplates {
    elevated: String,
    payload: Vec<u8>,
}

impl ScriptTemplates {
    /// Build from custom script text
    ///
    /// # Errors
    /// Returns `TemplateError` if the elevated template is malformed.
    pub fn new(elevated: impl Into<String>, payload: impl Into<Vec<u8>>) -> Result<Self, TemplateError> {
        let elevated = elevated.into();
        validate(&elevated, &ELEVATED_PARAMETERS)?;
        Ok(Self {
            elevated,
            payload: payload.into(),
        })
    }

    /// The scripts shipped with this crate
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            elevated: include_str!("../scripts/elevated.ps1").to_string(),
            payload: include_bytes!("../scripts/windows-feature.ps1").to_vec(),
        }
    }

    #[must_use]
    pub fn elevated(&self) -> &str {
        &self.elevated
    }

    /// Raw feature/capability installation script
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Parameters for one elevated wrapper script
#[derive(Clone)]
pub struct ElevatedOptions {
    pub username: String,
    pub password: String,
    pub task_name: String,
    pub task_description: String,
    pub command: String,
}

impl std::fmt::Debug for ElevatedOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevatedOptions")
            .field("username", &self.username)
            .field("task_name", &self.task_name)
            .field("task_description", &self.task_description)
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl ElevatedOptions {
    /// Options for the wrapper that runs the installation
    #[must_use]
    pub fn install(username: &str, password: &str, features: &[String], capabilities: &[String]) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            task_name: task_name("packer-windows-feature"),
            task_description: INSTALL_TASK_DESCRIPTION.to_string(),
            command: install_command(features, capabilities),
        }
    }

    /// Options for the wrapper that only checks for a pending reboot
    #[must_use]
    pub fn pending_reboot_check(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            task_name: task_name("packer-windows-feature-pending-reboot"),
            task_description: PENDING_REBOOT_TASK_DESCRIPTION.to_string(),
            command: pending_reboot_check_command(),
        }
    }

    /// Render `template` with these options.
    ///
    /// The elevated template embeds every value in a single-quoted
    /// PowerShell string, so each value is escaped for that context.
    ///
    /// # Errors
    /// Returns `TemplateError` if the template is malformed.
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        let username = escape_single_quoted(&self.username);
        let password = escape_single_quoted(&self.password);
        let task_name = escape_single_quoted(&self.task_name);
        let task_description = escape_single_quoted(&self.task_description);
        let command = escape_single_quoted(&self.command);

        render(
            template,
            &[
                ("Username", username.as_str()),
                ("Password", password.as_str()),
                ("TaskName", task_name.as_str()),
                ("TaskDescription", task_description.as_str()),
                ("Command", command.as_str()),
            ],
        )
    }
}

/// `<prefix>-<time ordered uuid>`, unique per call
#[must_use]
pub fn task_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::now_v7())
}

fn escape_single_quoted(value: &str) -> String {
    value.replace('\'', "''")
}

/// Quote a value as a PowerShell single-quoted string literal
#[must_use]
pub fn escape_powershell_string(value: &str) -> String {
    format!("'{}'", escape_single_quoted(value))
}

fn list_argument(flag: &str, values: &[String]) -> String {
    if values.is_empty() {
        return String::new();
    }

    let mut argument = format!(" -{flag} ");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            argument.push(',');
        }
        argument.push_str(&escape_powershell_string(value));
    }
    argument
}

/// ` -Features 'a','b'`, or nothing for an empty list
#[must_use]
pub fn features_argument(features: &[String]) -> String {
    list_argument("Features", features)
}

/// ` -Capabilities 'a','b'`, or nothing for an empty list
#[must_use]
pub fn capabilities_argument(capabilities: &[String]) -> String {
    list_argument("Capabilities", capabilities)
}

/// UTF-16LE bytes of `s`, as PowerShell expects for `-EncodedCommand`
#[must_use]
pub fn encode_utf16_le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// PowerShell invocation running `script` through `-EncodedCommand`
#[must_use]
pub fn encoded_powershell_command(script: &str) -> String {
    let mut command = String::from(POWERSHELL_PREFIX);
    let encoded = base64::engine::general_purpose::STANDARD.encode(encode_utf16_le(script));
    let _ = write!(command, " -EncodedCommand {encoded}");
    command
}

/// Command line that runs the payload for the given features and capabilities
#[must_use]
pub fn install_command(features: &[String], capabilities: &[String]) -> String {
    encoded_powershell_command(&format!(
        "{WINDOWS_FEATURE_PATH}{}{}",
        features_argument(features),
        capabilities_argument(capabilities)
    ))
}

/// Command line that runs the payload in check-only mode
#[must_use]
pub fn pending_reboot_check_command() -> String {
    encoded_powershell_command(&format!(
        "{WINDOWS_FEATURE_PATH} -OnlyCheckForRebootRequired"
    ))
}
