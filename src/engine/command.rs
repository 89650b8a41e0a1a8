//! Turns conversion parameters into a shell invocation.

use crate::model::{ConversionMode, ConversionParams, RunConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One element of the script's ordered argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptArg {
    Flag(&'static str),
    Option(&'static str, String),
    Raw(String),
}

impl ScriptArg {
    fn push_words(&self, out: &mut Vec<String>) {
        match self {
            ScriptArg::Flag(f) => out.push((*f).to_string()),
            ScriptArg::Option(f, v) => {
                out.push((*f).to_string());
                out.push(v.clone());
            }
            ScriptArg::Raw(v) => out.push(v.clone()),
        }
    }
}

/// Program, arguments and environment overrides for one process launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Overrides applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// Build the ordered flag list the conversion scripts expect.
pub fn script_args(
    params: &ConversionParams,
    temp_dir: &Path,
    privileged_helper: Option<&Path>,
) -> Vec<ScriptArg> {
    let mut args = vec![
        ScriptArg::Option("-i", path_arg(&params.installer)),
        ScriptArg::Option("-o", path_arg(&params.output_dir)),
        ScriptArg::Option("-t", path_arg(temp_dir)),
    ];
    if let Some(helper) = privileged_helper {
        args.push(ScriptArg::Option("-p", path_arg(helper)));
    }
    // -y: never stop for a confirmation prompt, stdin is not a terminal
    args.push(ScriptArg::Flag("-y"));
    args.push(ScriptArg::Option("-v", params.verbosity.to_string()));
    if params.dry_run {
        args.push(ScriptArg::Flag("-d"));
    }

    match &params.mode {
        ConversionMode::Iso => {}
        ConversionMode::Vdi { name, size_gb } => {
            args.push(ScriptArg::Option("-n", name.clone()));
            args.push(ScriptArg::Option("-s", format!("{}", size_gb.round() as u64)));
        }
    }

    args.extend(params.extra_args.iter().cloned().map(ScriptArg::Raw));
    args
}

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "'\\''"))
}

/// Render the `-c` string: quoted script path followed by quoted arguments.
pub fn command_line(script: &Path, args: &[ScriptArg]) -> String {
    let mut words = Vec::new();
    for a in args {
        a.push_words(&mut words);
    }
    let mut line = shell_quote(&path_arg(script));
    for w in words {
        line.push(' ');
        line.push_str(&shell_quote(&w));
    }
    line
}

/// Environment overrides for the script.
pub fn script_env(cfg: &RunConfig, script: &Path) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("TERM".to_string(), cfg.term.clone());
    let name = script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path_arg(script));
    env.insert(
        "AUTH_PROMPT".to_string(),
        format!("{name} wants to make changes."),
    );
    for (k, v) in &cfg.extra_env {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Assemble the full launch description for a resolved script.
pub fn build_process_spec(
    cfg: &RunConfig,
    params: &ConversionParams,
    script: &Path,
    temp_dir: &Path,
) -> ProcessSpec {
    let args = script_args(params, temp_dir, cfg.privileged_helper.as_deref());
    ProcessSpec {
        program: cfg.shell.clone(),
        args: vec!["-c".to_string(), command_line(script, &args)],
        env: script_env(cfg, script),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(mode: ConversionMode) -> ConversionParams {
        ConversionParams {
            mode,
            installer: PathBuf::from("/Applications/Install macOS Mojave.app"),
            output_dir: PathBuf::from("/Users/me/Desktop"),
            verbosity: 2,
            dry_run: false,
            extra_args: Vec::new(),
        }
    }

    #[test]
    fn iso_flags_are_ordered() {
        let args = script_args(
            &params(ConversionMode::Iso),
            Path::new("/tmp/t"),
            Some(Path::new("/opt/privileged")),
        );
        assert_eq!(
            args,
            vec![
                ScriptArg::Option("-i", "/Applications/Install macOS Mojave.app".into()),
                ScriptArg::Option("-o", "/Users/me/Desktop".into()),
                ScriptArg::Option("-t", "/tmp/t".into()),
                ScriptArg::Option("-p", "/opt/privileged".into()),
                ScriptArg::Flag("-y"),
                ScriptArg::Option("-v", "2".into()),
            ]
        );
    }

    #[test]
    fn vdi_size_is_rounded_and_extras_come_last() {
        let mut p = params(ConversionMode::Vdi {
            name: "mojave".into(),
            size_gb: 31.6,
        });
        p.dry_run = true;
        p.extra_args = vec!["--keep".into(), "x y".into()];
        let args = script_args(&p, Path::new("/tmp/t"), None);
        let tail: Vec<_> = args.iter().skip(4).cloned().collect();
        assert_eq!(
            tail,
            vec![
                ScriptArg::Option("-v", "2".into()),
                ScriptArg::Flag("-d"),
                ScriptArg::Option("-n", "mojave".into()),
                ScriptArg::Option("-s", "32".into()),
                ScriptArg::Raw("--keep".into()),
                ScriptArg::Raw("x y".into()),
            ]
        );
    }

    #[test]
    fn quoting_handles_spaces_and_single_quotes() {
        assert_eq!(shell_quote("/usr/bin"), "/usr/bin");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn command_line_quotes_script_and_values() {
        let line = command_line(
            Path::new("/My Scripts/InstallerApp2ISO.sh"),
            &[
                ScriptArg::Option("-i", "/Applications/Install macOS.app".into()),
                ScriptArg::Flag("-y"),
            ],
        );
        assert_eq!(
            line,
            "'/My Scripts/InstallerApp2ISO.sh' -i '/Applications/Install macOS.app' -y"
        );
    }

    #[test]
    fn env_forces_term_and_auth_prompt() {
        let mut cfg = RunConfig::default();
        cfg.extra_env.insert("LANG".into(), "C".into());
        let env = script_env(&cfg, Path::new("/x/InstallerApp2ISO.sh"));
        assert_eq!(env.get("TERM").map(String::as_str), Some("vt220"));
        assert_eq!(
            env.get("AUTH_PROMPT").map(String::as_str),
            Some("InstallerApp2ISO.sh wants to make changes.")
        );
        assert_eq!(env.get("LANG").map(String::as_str), Some("C"));
    }

    #[test]
    fn process_spec_uses_shell_dash_c() {
        let cfg = RunConfig::default();
        let spec = build_process_spec(
            &cfg,
            &params(ConversionMode::Iso),
            Path::new("/s/InstallerApp2ISO.sh"),
            Path::new("/tmp/t"),
        );
        assert_eq!(spec.program, PathBuf::from("/bin/bash"));
        assert_eq!(spec.args[0], "-c");
        assert!(spec.args[1].starts_with("/s/InstallerApp2ISO.sh -i "));
        assert!(spec.args[1].ends_with("-y -v 2"));
    }
}
