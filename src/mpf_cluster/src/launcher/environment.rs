//! Process environment and command preparation

use super::{cmdline::substitute_variables, state::LauncherSettings};
use crate::state::descriptors::{LauncherKind, ServiceDescriptor};
use eyre::bail;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
};

pub const BROKER_URI_VAR: &str = "ACTIVE_MQ_BROKER_URI";
pub const SERVICE_NAME_VAR: &str = "SERVICE_NAME";
pub const COMPONENT_NAME_VAR: &str = "COMPONENT_NAME";
pub const MPF_HOME_VAR: &str = "MPF_HOME";
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Line written to a component executor's stdin to ask it to quit
pub const QUIT_LINE: &str = "q";

/// How a running process is asked to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Send SIGTERM
    Terminate,
    /// Write this line to stdin
    StdinLine(String),
}

/// Per launcher-kind behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchStrategy {
    pub shutdown: ShutdownSignal,
    /// Directory appended to the library search path
    pub library_dir: Option<PathBuf>,
}

impl LaunchStrategy {
    pub fn for_kind(kind: LauncherKind, mpf_home: Option<&Path>) -> Self {
        match kind {
            LauncherKind::Generic => Self {
                shutdown: ShutdownSignal::Terminate,
                library_dir: None,
            },
            LauncherKind::Simple => Self {
                shutdown: ShutdownSignal::StdinLine(QUIT_LINE.to_string()),
                library_dir: mpf_home.map(|home| home.join("lib")),
            },
        }
    }
}

/// Variable lookup used for substitution: `MPF_HOME` from settings first,
/// then the node manager's own environment.
pub fn variable_lookup(settings: &LauncherSettings) -> impl Fn(&str) -> Option<String> + '_ {
    move |name| {
        if name == MPF_HOME_VAR {
            if let Some(home) = &settings.mpf_home {
                return Some(home.display().to_string());
            }
        }
        std::env::var(name).ok()
    }
}

/// Build the full environment of a launched process.
///
/// Starts from `inherited`, then sets the broker and identity variables,
/// then the service's own variables (appending with the separator when one
/// is given and a value already exists), then the strategy's additions.
pub fn build_environment<I, F>(
    service: &ServiceDescriptor,
    strategy: &LaunchStrategy,
    inherited: I,
    lookup: F,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
    F: Fn(&str) -> Option<String>,
{
    let mut env: BTreeMap<String, String> = inherited.into_iter().collect();

    env.insert(BROKER_URI_VAR.to_string(), service.broker_uri.clone());
    env.insert(
        SERVICE_NAME_VAR.to_string(),
        service.fully_qualified_name().to_string(),
    );
    env.insert(COMPONENT_NAME_VAR.to_string(), service.name().to_string());

    for var in &service.service.env {
        let value = substitute_variables(&var.value, &lookup);
        let value = match (&var.sep, env.get(&var.name)) {
            (Some(sep), Some(existing)) if !existing.is_empty() => {
                format!("{}{}{}", existing, sep, value)
            }
            _ => value,
        };
        env.insert(var.name.clone(), value);
    }

    if let Some(dir) = &strategy.library_dir {
        let dir = dir.display().to_string();
        let value = match env.get(LIBRARY_PATH_VAR) {
            Some(existing) if !existing.is_empty() => format!("{}:{}", existing, dir),
            _ => dir,
        };
        env.insert(LIBRARY_PATH_VAR.to_string(), value);
    }

    env
}

/// Prepare the command for one run of the service.
///
/// Fails if the configured working directory is unusable.
pub fn build_command(
    service: &ServiceDescriptor,
    program: &Path,
    args: &[String],
    env: &BTreeMap<String, String>,
    settings: &LauncherSettings,
) -> eyre::Result<tokio::process::Command> {
    let mut command = std::process::Command::new(program);
    command.args(args).env_clear().envs(env);

    if let Some(dir) = &service.service.working_dir {
        if !dir.is_dir() {
            bail!("working directory {} is not a directory", dir.display());
        }
        command.current_dir(dir);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        if let Some(pgid) = settings.pgid {
            command.process_group(pgid);
        }

        // Kernel kills the child if the node manager dies, even on SIGKILL
        #[cfg(target_os = "linux")]
        unsafe {
            command.pre_exec(|| {
                nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL)
                    .map_err(std::io::Error::other)
            });
        }
    }

    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut command: tokio::process::Command = command.into();
    command.kill_on_drop(true);
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::descriptors::{EnvVar, ServiceDefinition};

    fn service(env: Vec<EnvVar>) -> ServiceDescriptor {
        let def = ServiceDefinition {
            name: "Markup".to_string(),
            cmd: "/bin/true".to_string(),
            args: vec![],
            launcher: LauncherKind::Simple,
            env,
            working_dir: None,
            description: None,
        };
        ServiceDescriptor::new(def, "mpf1", 2, "tcp://amq:61616")
    }

    fn no_vars(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_identity_variables() {
        let strategy = LaunchStrategy::for_kind(LauncherKind::Generic, None);
        let env = build_environment(&service(vec![]), &strategy, [], no_vars);
        assert_eq!(env[BROKER_URI_VAR], "tcp://amq:61616");
        assert_eq!(env[SERVICE_NAME_VAR], "mpf1:Markup:2");
        assert_eq!(env[COMPONENT_NAME_VAR], "Markup");
    }

    #[test]
    fn test_separator_appends_instead_of_overwriting() {
        let vars = vec![
            EnvVar {
                name: "PATH".to_string(),
                value: "/opt/extra".to_string(),
                sep: Some(":".to_string()),
            },
            EnvVar {
                name: "MODE".to_string(),
                value: "fast".to_string(),
                sep: None,
            },
            EnvVar {
                name: "FRESH".to_string(),
                value: "1".to_string(),
                sep: Some(":".to_string()),
            },
        ];
        let inherited = [
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("MODE".to_string(), "slow".to_string()),
        ];
        let strategy = LaunchStrategy::for_kind(LauncherKind::Generic, None);
        let env = build_environment(&service(vars), &strategy, inherited, no_vars);
        assert_eq!(env["PATH"], "/usr/bin:/opt/extra");
        assert_eq!(env["MODE"], "fast");
        assert_eq!(env["FRESH"], "1");
    }

    #[test]
    fn test_simple_strategy_extends_library_path() {
        let strategy = LaunchStrategy::for_kind(LauncherKind::Simple, Some(Path::new("/opt/mpf")));
        assert_eq!(strategy.shutdown, ShutdownSignal::StdinLine("q".to_string()));

        let inherited = [(LIBRARY_PATH_VAR.to_string(), "/usr/lib".to_string())];
        let env = build_environment(&service(vec![]), &strategy, inherited, no_vars);
        assert_eq!(env[LIBRARY_PATH_VAR], "/usr/lib:/opt/mpf/lib");
    }

    #[test]
    fn test_lookup_prefers_configured_home() {
        let settings = LauncherSettings {
            mpf_home: Some(PathBuf::from("/srv/mpf")),
            ..Default::default()
        };
        let lookup = variable_lookup(&settings);
        assert_eq!(lookup(MPF_HOME_VAR).as_deref(), Some("/srv/mpf"));
    }

    #[test]
    fn test_missing_working_dir_fails() {
        let mut desc = service(vec![]);
        desc.service.working_dir = Some(PathBuf::from("/definitely/not/a/dir"));
        let result = build_command(
            &desc,
            Path::new("/bin/true"),
            &[],
            &BTreeMap::new(),
            &LauncherSettings::default(),
        );
        assert!(result.is_err());
    }
}
