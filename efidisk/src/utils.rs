use std::{
    env, io,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, trace};
use nix::unistd::Uid;
use types::EfiDiskError;

pub(crate) fn is_root() -> bool {
    let uid = Uid::effective();

    debug!("Running as UID {uid}");
    uid.is_root()
}

pub(crate) fn find_program(program: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;

    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}

/// Runs a command to completion, and returns its standard output
pub(crate) fn run_tool(command: &mut Command) -> Result<String, EfiDiskError> {
    let line = format!("{command:?}");
    let program = Path::new(command.get_program()).display().to_string();

    debug!("Running {line}");

    let output = command.output().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            EfiDiskError::Precondition(format!("{program} isn't installed"))
        } else {
            EfiDiskError::Io(e)
        }
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);

    for line in stdout.lines().chain(stderr.lines()) {
        trace!("{program}: {line}");
    }

    if !output.status.success() {
        return Err(EfiDiskError::ExternalTool {
            command: line,
            status: output.status,
            output: format!("{stdout}{stderr}").trim().to_owned(),
        });
    }

    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use test_log::test;
    use types::EfiDiskError;

    use super::{find_program, run_tool};

    #[test]
    fn test_run_tool_output() {
        assert_eq!(
            run_tool(Command::new("sh").args(["-c", "echo hello"])).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn test_run_tool_failure() {
        let err = run_tool(Command::new("sh").args(["-c", "echo oops >&2; exit 3"])).unwrap_err();

        match err {
            EfiDiskError::ExternalTool { status, output, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(output, "oops");
            }
            _ => panic!("Unexpected error {err:?}"),
        }
    }

    #[test]
    fn test_run_tool_missing() {
        let err = run_tool(&mut Command::new("/nonexistent/mkfs.fat")).unwrap_err();

        assert!(matches!(err, EfiDiskError::Precondition(_)));
    }

    #[test]
    fn test_find_program() {
        assert!(find_program("sh").is_some());
        assert!(find_program("definitely-not-a-real-program").is_none());
    }
}
