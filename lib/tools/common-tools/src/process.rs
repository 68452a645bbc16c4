//  Copyright (C) 2020-2022  The Authentic Execution developers.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Async subprocess helpers for driving the external toolchains.

use crate::Verbosity;
use failure::Fail;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Failure of an external toolchain invocation.
#[derive(Debug, Fail)]
pub enum ProcessError {
    /// The command exited with a non-zero status code
    #[fail(display = "command \"{} {}\" exited with code {}", program, args, code)]
    Failed {
        /// Program name
        program: String,
        /// Space-joined arguments
        args: String,
        /// Exit code (-1 if killed by a signal)
        code: i32,
    },
    /// The command could not be spawned or its I/O failed
    #[fail(display = "command \"{}\" failed to run: {}", program, cause)]
    Io {
        /// Program name
        program: String,
        /// Underlying cause
        cause: String,
    },
}

impl ProcessError {
    fn failed(program: &str, args: &[String], code: Option<i32>) -> Self {
        ProcessError::Failed {
            program: program.to_owned(),
            args: args.join(" "),
            code: code.unwrap_or(-1),
        }
    }

    fn io(program: &str, cause: &dyn std::fmt::Display) -> Self {
        ProcessError::Io {
            program: program.to_owned(),
            cause: cause.to_string(),
        }
    }
}

fn stderr_stdio() -> Stdio {
    if Verbosity::current() == Verbosity::Debug {
        Stdio::inherit()
    } else {
        Stdio::null()
    }
}

/// Run a program to completion, discarding its stdout.
pub async fn run(program: &str, args: &[String]) -> Result<(), ProcessError> {
    debug!("{} {}", program, args.join(" "));

    let status = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(stderr_stdio())
        .status()
        .await
        .map_err(|e| ProcessError::io(program, &e))?;

    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::failed(program, args, status.code()))
    }
}

/// Run a program to completion, capturing its stdout.
pub async fn run_with_output(program: &str, args: &[String]) -> Result<Vec<u8>, ProcessError> {
    debug!("{} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProcessError::io(program, &e))?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        error!("{}", String::from_utf8_lossy(&output.stderr));
        Err(ProcessError::failed(program, args, output.status.code()))
    }
}

/// Run a program to completion, redirecting its stdout to a file.
pub async fn run_with_output_file(
    program: &str,
    args: &[String],
    output_file: &Path,
) -> Result<(), ProcessError> {
    debug!("{} {}", program, args.join(" "));

    let file = std::fs::File::create(output_file).map_err(|e| ProcessError::io(program, &e))?;

    let status = Command::new(program)
        .args(args)
        .stdout(Stdio::from(file))
        .stderr(stderr_stdio())
        .status()
        .await
        .map_err(|e| ProcessError::io(program, &e))?;

    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::failed(program, args, status.code()))
    }
}

/// Run a full command line through the shell. Needed for the TrustZone make
/// invocation, which sets variables in the command line itself.
pub async fn run_shell(command_line: &str) -> Result<(), ProcessError> {
    debug!("{}", command_line);

    let status = Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .stdout(Stdio::null())
        .stderr(stderr_stdio())
        .status()
        .await
        .map_err(|e| ProcessError::io("sh", &e))?;

    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::Failed {
            program: "sh -c".to_owned(),
            args: command_line.to_owned(),
            code: status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_reports_exit_code() {
        let err = run("false", &[]).await.expect_err("false must fail");
        match err {
            ProcessError::Failed { code, .. } => assert_eq!(code, 1),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn run_with_output_captures_stdout() {
        let out = run_with_output("echo", &["-n".to_owned(), "aex".to_owned()])
            .await
            .expect("echo must succeed");
        assert_eq!(out, b"aex");
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let err = run("aex-no-such-program", &[])
            .await
            .expect_err("spawn must fail");
        match err {
            ProcessError::Io { program, .. } => assert_eq!(program, "aex-no-such-program"),
            other => panic!("unexpected error: {}", other),
        }
    }
}
