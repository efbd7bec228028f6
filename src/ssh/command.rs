//! Building the ssh invocation that runs `git-lfs-transfer` remotely.

use std::path::Path;

use crate::config::ConfigSource;

const DEFAULT_SSH_COMMAND: &str = "ssh";

/// Remote endpoint of an SSH transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SshMetadata {
    /// `user@host` or just `host`.
    pub user_and_host: String,
    /// Empty for the default port.
    pub port: String,
    /// Repository path on the remote side.
    pub path: String,
}

/// Command-line flavours of ssh clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshVariant {
    Ssh,
    Simple,
    Putty,
    TortoisePlink,
}

impl SshVariant {
    /// Parse a configured variant; `None` asks for auto-detection.
    fn from_setting(value: &str) -> Option<SshVariant> {
        match value {
            "ssh" => Some(SshVariant::Ssh),
            "simple" => Some(SshVariant::Simple),
            "putty" | "plink" => Some(SshVariant::Putty),
            "tortoiseplink" => Some(SshVariant::TortoisePlink),
            "auto" => None,
            _ => Some(SshVariant::Ssh),
        }
    }

    /// Guess from the executable name.
    fn detect(program: &str) -> SshVariant {
        let base = Path::new(program)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        if base.eq_ignore_ascii_case("plink") {
            SshVariant::Putty
        } else if base.eq_ignore_ascii_case("tortoiseplink") {
            SshVariant::TortoisePlink
        } else {
            SshVariant::Ssh
        }
    }

    fn port_flag(self) -> &'static str {
        match self {
            SshVariant::Putty | SshVariant::TortoisePlink => "-P",
            SshVariant::Ssh | SshVariant::Simple => "-p",
        }
    }
}

/// Program and arguments to spawn for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Trace every pktline frame (`GIT_TRACE_PACKET`).
    pub trace_packets: bool,
}

impl TransferCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        TransferCommand {
            program: program.into(),
            args,
            trace_packets: false,
        }
    }

    pub fn trace_packets(mut self, enabled: bool) -> Self {
        self.trace_packets = enabled;
        self
    }

    /// The ssh command running `git-lfs-transfer <path> <operation>` on the
    /// remote host.
    ///
    /// The client comes from `GIT_SSH_COMMAND`, `GIT_SSH`, `core.sshcommand`
    /// or plain `ssh`, in that order. Command strings (as opposed to a bare
    /// program) are run through `sh -c` so their own quoting applies.
    pub fn for_remote(
        os_env: &dyn ConfigSource,
        git_env: &dyn ConfigSource,
        meta: &SshMetadata,
        operation: &str,
    ) -> Self {
        let (program, shell_command) = ssh_program(os_env, git_env);
        let variant = variant(os_env, git_env, &program);

        let mut args = Vec::with_capacity(6);
        if variant == SshVariant::TortoisePlink {
            // TortoisePlink needs -batch to behave like ssh/plink.
            args.push("-batch".to_string());
        }
        if !meta.port.is_empty() {
            args.push(variant.port_flag().to_string());
            args.push(meta.port.clone());
        }
        if variant == SshVariant::Ssh {
            args.push("--".to_string());
            args.push(meta.user_and_host.clone());
        } else {
            // No option separator, so a host can't be allowed to look like one.
            args.push(meta.user_and_host.trim_start_matches('-').to_string());
        }
        args.push(format!("git-lfs-transfer {} {}", meta.path, operation));

        let (program, args) = match shell_command {
            Some(command) => {
                let mut shell_args = vec!["-c".to_string(), format!("{command} \"$@\""), command];
                shell_args.extend(args);
                ("sh".to_string(), shell_args)
            }
            None => (program, args),
        };
        tracing::debug!("run_command: {} {}", program, args.join(" "));

        TransferCommand {
            program,
            args,
            trace_packets: os_env.bool("GIT_TRACE_PACKET", false),
        }
    }
}

/// The ssh executable, plus the full command string if it has to go
/// through a shell.
fn ssh_program(os_env: &dyn ConfigSource, git_env: &dyn ConfigSource) -> (String, Option<String>) {
    if let Some(found) = os_env.get("GIT_SSH_COMMAND").and_then(|cmd| shell_command(&cmd)) {
        return found;
    }
    if let Some(ssh) = os_env.get("GIT_SSH").filter(|ssh| !ssh.is_empty()) {
        return (ssh, None);
    }
    if let Some(found) = git_env.get("core.sshcommand").and_then(|cmd| shell_command(&cmd)) {
        return found;
    }
    (DEFAULT_SSH_COMMAND.to_string(), None)
}

fn shell_command(command: &str) -> Option<(String, Option<String>)> {
    let program = first_field(command)?;
    Some((program, Some(command.to_string())))
}

/// First shell word of `command`, honouring single and double quotes.
fn first_field(command: &str) -> Option<String> {
    let mut field = String::new();
    let mut quote = None;
    let mut started = false;
    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => field.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                started = true;
            }
            None if c.is_whitespace() => {
                if started {
                    break;
                }
            }
            None => {
                field.push(c);
                started = true;
            }
        }
    }
    started.then_some(field)
}

fn variant(os_env: &dyn ConfigSource, git_env: &dyn ConfigSource, program: &str) -> SshVariant {
    let setting = os_env
        .get("GIT_SSH_VARIANT")
        .or_else(|| git_env.get("ssh.variant"));
    match setting.as_deref().map(SshVariant::from_setting) {
        Some(Some(variant)) => variant,
        _ => SshVariant::detect(program),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn meta(port: &str) -> SshMetadata {
        SshMetadata {
            user_and_host: "git@example.com".into(),
            port: port.into(),
            path: "org/repo.git".into(),
        }
    }

    #[test]
    fn test_plain_ssh() {
        let cmd = TransferCommand::for_remote(&env(&[]), &env(&[]), &meta(""), "download");
        assert_eq!(cmd.program, "ssh");
        assert_eq!(
            cmd.args,
            vec!["--", "git@example.com", "git-lfs-transfer org/repo.git download"]
        );
        assert!(!cmd.trace_packets);
    }

    #[test]
    fn test_ssh_with_port() {
        let cmd = TransferCommand::for_remote(&env(&[]), &env(&[]), &meta("2222"), "upload");
        assert_eq!(
            cmd.args,
            vec!["-p", "2222", "--", "git@example.com", "git-lfs-transfer org/repo.git upload"]
        );
    }

    #[test]
    fn test_plink_detection() {
        let os = env(&[("GIT_SSH", "/opt/putty/plink.exe")]);
        let cmd = TransferCommand::for_remote(&os, &env(&[]), &meta("2222"), "upload");
        assert_eq!(cmd.program, "/opt/putty/plink.exe");
        assert_eq!(
            cmd.args,
            vec!["-P", "2222", "git@example.com", "git-lfs-transfer org/repo.git upload"]
        );
    }

    #[test]
    fn test_tortoiseplink_batch() {
        let os = env(&[("GIT_SSH", "TortoisePlink")]);
        let cmd = TransferCommand::for_remote(&os, &env(&[]), &meta(""), "download");
        assert_eq!(cmd.args[0], "-batch");
    }

    #[test]
    fn test_variant_setting_overrides_detection() {
        let os = env(&[("GIT_SSH", "plink"), ("GIT_SSH_VARIANT", "ssh")]);
        let cmd = TransferCommand::for_remote(&os, &env(&[]), &meta("22"), "download");
        assert_eq!(cmd.args[0], "-p");

        let git = env(&[("ssh.variant", "simple")]);
        let cmd = TransferCommand::for_remote(&env(&[]), &git, &meta(""), "download");
        assert_eq!(cmd.args[0], "git@example.com");
    }

    #[test]
    fn test_leading_dashes_stripped_without_separator() {
        let os = env(&[("GIT_SSH_VARIANT", "putty")]);
        let mut m = meta("");
        m.user_and_host = "-oProxyCommand=evil".into();
        let cmd = TransferCommand::for_remote(&os, &env(&[]), &m, "download");
        assert_eq!(cmd.args[0], "oProxyCommand=evil");
    }

    #[test]
    fn test_ssh_command_uses_shell() {
        let os = env(&[("GIT_SSH_COMMAND", "ssh -i 'my key'"), ("GIT_TRACE_PACKET", "1")]);
        let cmd = TransferCommand::for_remote(&os, &env(&[]), &meta(""), "download");
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.args[0], "-c");
        assert_eq!(cmd.args[1], "ssh -i 'my key' \"$@\"");
        assert_eq!(cmd.args[2], "ssh -i 'my key'");
        assert_eq!(&cmd.args[3..5], ["--", "git@example.com"]);
        assert!(cmd.trace_packets);
    }

    #[test]
    fn test_core_sshcommand() {
        let git = env(&[("core.sshcommand", "\"/usr/bin/plink\" -v")]);
        let cmd = TransferCommand::for_remote(&env(&[]), &git, &meta("1"), "download");
        assert_eq!(cmd.program, "sh");
        assert_eq!(&cmd.args[3..5], ["-P", "1"]);
    }

    #[test]
    fn test_first_field() {
        assert_eq!(first_field("  ssh -v").as_deref(), Some("ssh"));
        assert_eq!(first_field("'my ssh' -v").as_deref(), Some("my ssh"));
        assert_eq!(first_field("   "), None);
    }
}
