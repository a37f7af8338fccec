//! External command execution.
//!
//! Every program the image builder drives (`parted`, `kpartx`, `mount`,
//! `grub-install`, ...) is described by a [`Cmd`] and executed through a
//! [`CommandRunner`]. Production code uses [`SystemRunner`]; tests swap in a
//! recording fake so command sequences can be asserted without root.
//!
//! # Example
//!
//! ```rust,ignore
//! use device_image::process::{Cmd, SystemRunner};
//!
//! let runner = SystemRunner::new(false);
//! let out = Cmd::new("blockdev")
//!     .args(["--getss", "/dev/mapper/loop0p1"])
//!     .run(&runner)?;
//! println!("{}", out.stdout.trim());
//! ```

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{ImageError, Result};

/// A command line to execute, built up fluently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    /// Feed `input` to the program's standard input.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Label used instead of the rendered command line when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the output even when the program exits nonzero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn input(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// The command line as a single space separated string.
    pub fn render(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Execute on `runner`, turning a nonzero exit into [`ImageError::CommandFailed`].
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<CommandOutput> {
        let output = runner.execute(self)?;
        if output.success || self.allow_fail {
            return Ok(output);
        }
        Err(ImageError::CommandFailed {
            command: self.error_msg.clone().unwrap_or_else(|| self.render()),
            output: output.combined(),
        })
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (false, true) => stdout.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

/// Executes commands. Implementations must not interpret exit codes.
pub trait CommandRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandOutput>;
}

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner {
    verbose: bool,
}

impl SystemRunner {
    /// With `verbose`, captured output is teed to the debug log line by line.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl CommandRunner for SystemRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandOutput> {
        let rendered = cmd.render();
        debug!("running {}", rendered);

        let spawn_err = |source| ImageError::CommandSpawn {
            command: rendered.clone(),
            source,
        };

        let mut command = Command::new(cmd.program());
        command.args(cmd.get_args());

        let output = match cmd.input() {
            Some(input) => {
                let mut child = command
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(spawn_err)?;
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(input.as_bytes()).map_err(spawn_err)?;
                }
                child.wait_with_output().map_err(spawn_err)?
            }
            None => command.output().map_err(spawn_err)?,
        };

        let result = CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if self.verbose {
            for line in result.stdout.lines().chain(result.stderr.lines()) {
                debug!("{}: {}", cmd.program(), line);
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Recording runner for tests.

    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;

    use super::{Cmd, CommandOutput, CommandRunner};
    use crate::error::Result;

    type Hook = Rc<dyn Fn(&Cmd)>;

    #[derive(Default)]
    struct FakeState {
        calls: Vec<Cmd>,
        scripted: Vec<(String, VecDeque<CommandOutput>)>,
        hooks: Vec<(String, Hook)>,
    }

    /// Records every command and answers from a script keyed by command prefix.
    ///
    /// Clones share state, so a test can keep a handle after boxing one
    /// into a build context. Unscripted commands succeed with empty output.
    #[derive(Clone, Default)]
    pub struct FakeRunner {
        state: Rc<RefCell<FakeState>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue `output` for the next command whose rendered line starts with `prefix`.
        pub fn respond(&self, prefix: &str, output: CommandOutput) {
            let mut state = self.state.borrow_mut();
            if let Some((_, queue)) = state.scripted.iter_mut().find(|(p, _)| p == prefix) {
                queue.push_back(output);
            } else {
                state
                    .scripted
                    .push((prefix.to_string(), VecDeque::from([output])));
            }
        }

        pub fn fail(&self, prefix: &str, stderr: &str) {
            self.respond(prefix, CommandOutput::failed(1, stderr));
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.borrow().calls.iter().map(Cmd::render).collect()
        }

        pub fn commands(&self) -> Vec<Cmd> {
            self.state.borrow().calls.clone()
        }

        /// Position of the first call starting with `prefix`.
        pub fn position(&self, prefix: &str) -> Option<usize> {
            self.calls().iter().position(|c| c.starts_with(prefix))
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }

        /// Run `hook` after every successful command starting with `prefix`.
        pub fn on(&self, prefix: &str, hook: impl Fn(&Cmd) + 'static) {
            self.state
                .borrow_mut()
                .hooks
                .push((prefix.to_string(), Rc::new(hook)));
        }

        /// Make a successful `umount DIR` leave DIR empty, as a real
        /// unmount would hide whatever was written into the filesystem.
        pub fn emulate_unmount(&self) {
            self.on("umount", |cmd| {
                let Some(target) = cmd.get_args().last() else {
                    return;
                };
                let Ok(entries) = fs::read_dir(Path::new(target)) else {
                    return;
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        let _ = fs::remove_dir_all(&path);
                    } else {
                        let _ = fs::remove_file(&path);
                    }
                }
            });
        }
    }

    impl CommandRunner for FakeRunner {
        fn execute(&self, cmd: &Cmd) -> Result<CommandOutput> {
            let rendered = cmd.render();
            let (output, hooks) = {
                let mut state = self.state.borrow_mut();
                state.calls.push(cmd.clone());
                let output = state
                    .scripted
                    .iter_mut()
                    .filter(|(prefix, queue)| rendered.starts_with(prefix.as_str()) && !queue.is_empty())
                    .max_by_key(|(prefix, _)| prefix.len())
                    .and_then(|(_, queue)| queue.pop_front())
                    .unwrap_or_else(|| CommandOutput::ok(""));
                let hooks: Vec<Hook> = state
                    .hooks
                    .iter()
                    .filter(|(prefix, _)| rendered.starts_with(prefix.as_str()))
                    .map(|(_, hook)| Rc::clone(hook))
                    .collect();
                (output, hooks)
            };
            if output.success {
                for hook in hooks {
                    hook(cmd);
                }
            }
            Ok(output)
        }
    }
}
