use std::io::{BufRead, BufReader, Lines};
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::error::ToolError;

/// The stdout of a shell command, exposed as a lazy stream of lines.
///
/// The command runs under `/bin/sh -c` with stderr discarded. Dropping the
/// stream closes the read end of the pipe, so a child that is still
/// writing exits on SIGPIPE, and then reaps the child. Reaching EOF is
/// normal termination; a non-zero exit status is not an error.
pub struct ShellLines {
    child: Child,
    lines: Option<Lines<BufReader<ChildStdout>>>,
}

impl ShellLines {
    pub fn spawn(command: &str) -> Result<Self, ToolError> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|error| ToolError::Spawn {
                command: command.to_string(),
                error,
            })?;
        // stdout is present because it was requested as piped.
        let stdout = child.stdout.take().expect("child stdout was piped");
        Ok(Self {
            child,
            lines: Some(BufReader::new(stdout).lines()),
        })
    }
}

impl Iterator for ShellLines {
    type Item = String;

    /// The next line without its trailing newline. Read errors on the
    /// pipe end the stream, like EOF.
    fn next(&mut self) -> Option<String> {
        self.lines.as_mut()?.next()?.ok()
    }
}

impl Drop for ShellLines {
    fn drop(&mut self) {
        // Close our end of the pipe before reaping.
        drop(self.lines.take());
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_lines_without_newlines() {
        let lines: Vec<String> = ShellLines::spawn("printf 'one\\ntwo\\n'")
            .unwrap()
            .collect();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn nonzero_exit_is_just_eof() {
        let lines: Vec<String> = ShellLines::spawn("printf 'only\\n'; exit 3")
            .unwrap()
            .collect();
        assert_eq!(lines, vec!["only".to_string()]);
    }

    #[test]
    fn stderr_is_discarded() {
        let lines: Vec<String> = ShellLines::spawn("echo noise >&2").unwrap().collect();
        assert!(lines.is_empty());
    }
}
