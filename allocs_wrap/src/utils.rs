use crate::{Error, Result};

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

// Import the host/target triple and packaging defaults, set by the build script
include!(concat!(env!("OUT_DIR"), "/build_info.rs"));

/// Trait for writing UTF-8 data to a sink.
pub trait WriteStr {
    fn write_fmt(&mut self, args: fmt::Arguments) -> io::Result<()>;

    fn write_str(&mut self, s: &str) -> io::Result<()> {
        write!(self, "{}", s)
    }
}

impl<W: Write> WriteStr for W {
    fn write_fmt(&mut self, args: fmt::Arguments) -> io::Result<()> {
        <W as Write>::write_fmt(self, args)
    }
}

pub struct StringWriter(pub String);

impl WriteStr for StringWriter {
    fn write_fmt(&mut self, args: fmt::Arguments) -> io::Result<()> {
        <String as fmt::Write>::write_fmt(&mut self.0, args)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "writing to string failed"))
    }
}

/// A diagnostics file owned by one build step.
///
/// Subprocess stderr is redirected here rather than to the terminal. The file
/// is closed when the `LogFile` is dropped, whichever way the step exits.
pub struct LogFile {
    path: PathBuf,
    file: File,
}

impl LogFile {
    /// Creates (truncating) the log at `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// The log for a build artifact: `<realpath(artifact)><suffix>`.
    pub fn beside(artifact: &Path, suffix: &str) -> io::Result<Self> {
        let real = fs::canonicalize(artifact).unwrap_or_else(|_| artifact.to_path_buf());
        let mut name = real.into_os_string();
        name.push(suffix);
        Self::create(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A handle suitable for a child's stdout/stderr.
    pub fn stdio(&self) -> io::Result<Stdio> {
        Ok(Stdio::from(self.file.try_clone()?))
    }

    pub fn note(&mut self, args: fmt::Arguments) {
        // the log is best-effort; a full disk shouldn't mask the real failure
        let _ = Write::write_fmt(&mut self.file, args);
        let _ = self.file.write_all(b"\n");
    }

    /// Copies everything logged so far to our stderr.
    pub fn surface(&mut self) {
        let _ = Write::flush(&mut self.file);
        match fs::read_to_string(&self.path) {
            Ok(contents) => eprint!("{}", contents),
            Err(e) => warn!("couldn't read back log '{}': {}", self.path.display(), e),
        }
    }
}

/// Renders a command line for diagnostics.
pub fn command_line(cmd: &Command) -> String {
    let mut line = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

/// Runs `cmd` to completion, sending its stderr to `log` if there is one.
///
/// Any non-zero status becomes `Error::SubprocessFailure`; a child killed by a
/// signal reports status -1.
pub fn run(cmd: &mut Command, log: Option<&mut LogFile>) -> Result<()> {
    let line = command_line(cmd);
    debug!("calling {}", line);

    let status = match log {
        Some(log) => {
            log.note(format_args!("Running: {}", line));
            cmd.stderr(log.stdio()?);
            let status = cmd.status()?;
            log.note(format_args!("Exit status was {}", status.code().unwrap_or(-1)));
            status
        }
        None => cmd.status()?,
    };

    if status.success() {
        Ok(())
    } else {
        let tool = cmd.get_program().to_string_lossy().into_owned();
        let code = status.code().unwrap_or(-1); // return -1 on any signals for now
        debug!("`{}` exited with {}", tool, code);
        Err(Error::SubprocessFailure { tool, code })
    }
}

/// Runs `cmd` and returns its stdout, regardless of exit status.
pub fn capture(cmd: &mut Command, log: Option<&mut LogFile>) -> Result<(bool, String)> {
    debug!("calling {}", command_line(cmd));
    if let Some(log) = log {
        log.note(format_args!("Running: {}", command_line(cmd)));
        cmd.stderr(log.stdio()?);
    }
    let output = cmd.stdout(Stdio::piped()).output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    Ok((output.status.success(), stdout))
}
