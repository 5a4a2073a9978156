//! Project tasks: named shell commands run on the local host.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::config::{expand_home, ProjectConfig};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("unknown task '{name}' (available: {known})")]
    Unknown { name: String, known: String },

    #[error("cannot quote task arguments: {0}")]
    Quote(String),

    #[error("failed to run task {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// A task ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    pub description: String,
    pub command: String,
    pub workdir: PathBuf,
}

/// Declared tasks as `(name, description)`, in declaration order.
#[must_use]
pub fn list_tasks(config: &ProjectConfig) -> Vec<(&str, &str)> {
    config
        .tasks
        .iter()
        .map(|(name, task)| (name.as_str(), task.description.as_str()))
        .collect()
}

/// Look up `name`. The task runs in its own `workdir` if set (relative to
/// `project_dir`), otherwise in the first cluster's workdir.
///
/// # Errors
///
/// Returns [`TaskError::Unknown`] if no task has that name.
pub fn resolve_task(config: &ProjectConfig, project_dir: &Path, name: &str) -> Result<Task, TaskError> {
    let Some(task) = config.tasks.get(name) else {
        return Err(TaskError::Unknown {
            name: name.to_string(),
            known: config.tasks.keys().cloned().collect::<Vec<_>>().join(", "),
        });
    };

    let workdir = match &task.workdir {
        Some(dir) => project_dir.join(expand_home(Path::new(dir))),
        None => config
            .clusters
            .values()
            .next()
            .map_or_else(|| project_dir.to_path_buf(), |c| expand_home(Path::new(&c.workdir))),
    };

    Ok(Task {
        name: name.to_string(),
        description: task.description.clone(),
        command: task.command.clone(),
        workdir,
    })
}

/// The task command with `extra` appended, each argument shell-quoted.
///
/// # Errors
///
/// Returns [`TaskError::Quote`] if an argument cannot be quoted.
pub fn command_line(task: &Task, extra: &[String]) -> Result<String, TaskError> {
    if extra.is_empty() {
        return Ok(task.command.clone());
    }
    let quoted = shlex::try_join(extra.iter().map(String::as_str))
        .map_err(|e| TaskError::Quote(e.to_string()))?;
    Ok(format!("{} {quoted}", task.command))
}

/// Run `task` with `sh -c`, attached to the terminal, with `INFRA` set to
/// the project name. Returns the command's exit code.
///
/// # Errors
///
/// Returns [`TaskError::Spawn`] if the shell cannot be started.
pub async fn run_task(project: &str, task: &Task, extra: &[String]) -> Result<i32, TaskError> {
    let line = command_line(task, extra)?;
    info!(task = %task.name, workdir = %task.workdir.display(), "Running task");

    let status = Command::new("sh")
        .arg("-c")
        .arg(&line)
        .env("INFRA", project)
        .current_dir(&task.workdir)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|source| TaskError::Spawn {
            name: task.name.clone(),
            source,
        })?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_project;
    use tempfile::TempDir;

    const DOC: &str = r"
project: lab
clusters:
  c1:
    base_image: base
    workdir: /srv/lab/c1
    vms: {}
tasks:
  ping:
    description: Ping every VM
    command: ansible all -m ping
  deploy:
    description: Run the playbook
    command: ansible-playbook site.yml
    workdir: ansible
";

    fn config() -> ProjectConfig {
        parse_project(Path::new("conf.yml"), DOC).unwrap()
    }

    #[test]
    fn test_list_in_declaration_order() {
        let config = config();
        assert_eq!(
            list_tasks(&config),
            [("ping", "Ping every VM"), ("deploy", "Run the playbook")]
        );
    }

    #[test]
    fn test_resolve_workdir() {
        let config = config();
        let project = Path::new("/home/me/lab");

        let ping = resolve_task(&config, project, "ping").unwrap();
        assert_eq!(ping.workdir, PathBuf::from("/srv/lab/c1"));

        let deploy = resolve_task(&config, project, "deploy").unwrap();
        assert_eq!(deploy.workdir, PathBuf::from("/home/me/lab/ansible"));

        match resolve_task(&config, project, "nope") {
            Err(TaskError::Unknown { known, .. }) => assert_eq!(known, "ping, deploy"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_extra_arguments_are_quoted() {
        let task = resolve_task(&config(), Path::new("/p"), "ping").unwrap();
        assert_eq!(command_line(&task, &[]).unwrap(), "ansible all -m ping");

        let line = command_line(&task, &["-e".into(), "msg=hello world".into()]).unwrap();
        assert_eq!(
            shlex::split(&line).unwrap(),
            ["ansible", "all", "-m", "ping", "-e", "msg=hello world"]
        );
    }

    #[tokio::test]
    async fn test_run_sets_infra_and_propagates_exit_code() {
        let dir = TempDir::new().unwrap();
        let task = Task {
            name: "exit-code".into(),
            description: String::new(),
            command: "echo \"$INFRA\" > infra.txt; exit".into(),
            workdir: dir.path().to_path_buf(),
        };

        let code = run_task("lab", &task, &["3".into()]).await.unwrap();
        assert_eq!(code, 3);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("infra.txt")).unwrap(),
            "lab\n"
        );
    }
}
