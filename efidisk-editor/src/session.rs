use core::time::Duration;
use std::{
    io::{self, Read, Write as _},
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread,
    time::Instant,
};

use log::{debug, error, trace, warn};
use types::DialogueError;

use crate::script::Prompt;

const READ_CHUNK_SIZE: usize = 4096;
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
enum Output {
    Data(Vec<u8>),
    Closed,
}

fn spawn_reader<R>(mut reader: R, tx: Sender<Output>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK_SIZE];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(len) => {
                    if tx.send(Output::Data(buf[..len].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("Reading the program output failed: {e}");
                    break;
                }
            }
        }

        tx.send(Output::Closed).ok();
    });
}

// Appends the complete UTF-8 sequences found in `raw` to `text`, and keeps a trailing incomplete
// sequence in `raw` until the rest shows up.
fn decode_utf8(raw: &mut Vec<u8>, text: &mut String) {
    loop {
        match core::str::from_utf8(raw) {
            Ok(valid) => {
                text.push_str(valid);
                raw.clear();
                return;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&raw[..valid]));

                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        raw.drain(..valid + len);
                    }
                    None => {
                        raw.drain(..valid);
                        return;
                    }
                }
            }
        }
    }
}

/// A prompt found in the program output
#[derive(Debug)]
pub struct Matched {
    /// Index of the matching prompt in the list we were waiting for
    pub index: usize,

    /// Output received before the prompt
    pub before: String,
}

/// A live interactive program, fed through its standard input and read back through its
/// standard output and error.
///
/// The program is always reaped when the session is dropped. If a dialogue error occurred, the
/// program is killed first, otherwise it is given some time to exit on its own.
#[derive(Debug)]
pub struct DialogueSession {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<Output>,
    open_streams: usize,
    undecoded: Vec<u8>,
    pending: String,
    timeout: Option<Duration>,
    poisoned: bool,
    status: Option<ExitStatus>,
}

impl DialogueSession {
    /// Starts the program with piped standard streams.
    ///
    /// # Errors
    ///
    /// If the program can't be started.
    pub fn spawn(mut command: Command, timeout: Option<Duration>) -> Result<Self, DialogueError> {
        let program = command.get_program().to_string_lossy().into_owned();

        debug!("Spawning {command:?}");

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DialogueError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel();
        let mut open_streams = 0;

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone());
            open_streams += 1;
        }

        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx);
            open_streams += 1;
        }

        Ok(Self {
            program,
            stdin: child.stdin.take(),
            child,
            output: rx,
            open_streams,
            undecoded: Vec::new(),
            pending: String::new(),
            timeout,
            poisoned: false,
            status: None,
        })
    }

    /// Name of the program driven by this session
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether a dialogue error happened during this session
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn poison<T>(&mut self, err: DialogueError) -> Result<T, DialogueError> {
        warn!("{}: {err}", self.program);
        self.poisoned = true;
        Err(err)
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    fn waited(&self) -> Duration {
        self.timeout.unwrap_or_default()
    }

    // Returns false on timeout
    fn receive(&mut self, deadline: Option<Instant>) -> bool {
        let msg = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());

                match self.output.recv_timeout(remaining) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => return false,
                    Err(RecvTimeoutError::Disconnected) => Output::Closed,
                }
            }
            None => self.output.recv().unwrap_or(Output::Closed),
        };

        match msg {
            Output::Data(data) => {
                trace!("{} -> {:?}", self.program, String::from_utf8_lossy(&data));
                self.undecoded.extend_from_slice(&data);
                decode_utf8(&mut self.undecoded, &mut self.pending);
            }
            Output::Closed => {
                self.open_streams = self.open_streams.saturating_sub(1);

                if self.open_streams == 0 && !self.undecoded.is_empty() {
                    self.pending
                        .push_str(&String::from_utf8_lossy(&self.undecoded));
                    self.undecoded.clear();
                }
            }
        }

        true
    }

    /// Waits until the program output ends with one of the prompts.
    ///
    /// The output up to the end of the prompt is consumed. Output that doesn't match is kept
    /// while we wait for more.
    ///
    /// # Errors
    ///
    /// If the program closes its output or if the timeout expires before any prompt shows up.
    /// The session is poisoned in both cases.
    pub fn expect(&mut self, prompts: &[&Prompt]) -> Result<Matched, DialogueError> {
        let deadline = self.deadline();

        loop {
            let found = prompts
                .iter()
                .enumerate()
                .find_map(|(idx, prompt)| prompt.find(&self.pending).map(|(start, end)| (idx, start, end)));

            if let Some((index, start, end)) = found {
                debug!("{}: found prompt {}", self.program, prompts[index].name());

                let before = self.pending[..start].to_owned();
                self.pending.drain(..end);

                return Ok(Matched { index, before });
            }

            if self.open_streams == 0 {
                let err = DialogueError::UnexpectedEof {
                    prompt: Prompt::describe(prompts),
                    output: self.pending.clone(),
                };

                return self.poison(err);
            }

            if !self.receive(deadline) {
                let err = DialogueError::Timeout {
                    prompt: Prompt::describe(prompts),
                    waited: self.waited(),
                };

                return self.poison(err);
            }
        }
    }

    /// Waits until the program closes its output, and returns everything it printed since the
    /// last prompt.
    ///
    /// # Errors
    ///
    /// If the timeout expires first. The session is poisoned in that case.
    pub fn expect_eof(&mut self) -> Result<String, DialogueError> {
        let deadline = self.deadline();

        while self.open_streams > 0 {
            if !self.receive(deadline) {
                let err = DialogueError::Timeout {
                    prompt: String::from("end of output"),
                    waited: self.waited(),
                };

                return self.poison(err);
            }
        }

        Ok(core::mem::take(&mut self.pending))
    }

    /// Sends a line to the program
    ///
    /// # Errors
    ///
    /// If the program standard input is closed. The session is poisoned in that case.
    pub fn send_line(&mut self, line: &str) -> Result<(), DialogueError> {
        debug!("{} <- {line:?}", self.program);

        let res = match &mut self.stdin {
            Some(stdin) => stdin
                .write_all(line.as_bytes())
                .and_then(|()| stdin.write_all(b"\n"))
                .and_then(|()| stdin.flush()),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Standard input already closed",
            )),
        };

        match res {
            Ok(()) => Ok(()),
            Err(e) => self.poison(DialogueError::Io(e)),
        }
    }

    fn wait_for_exit(&mut self) -> Result<ExitStatus, io::Error> {
        let deadline = Instant::now() + CLOSE_GRACE_PERIOD;

        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }

            thread::sleep(CLOSE_POLL_INTERVAL);
        }

        warn!("{} didn't exit in time, killing it.", self.program);
        self.child.kill()?;
        self.child.wait()
    }

    /// Ends the session and reaps the program.
    ///
    /// A healthy session is sent the `quit` line (if any) and has its standard input closed,
    /// then the program is waited for. A poisoned session gets its program killed right away.
    /// Calling this more than once returns the status collected the first time.
    ///
    /// # Errors
    ///
    /// If the program can't be killed or waited for.
    pub fn close(&mut self, quit: Option<&str>) -> Result<ExitStatus, DialogueError> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        let status = if self.poisoned {
            debug!("Killing {}", self.program);

            match self.child.try_wait()? {
                Some(status) => status,
                None => {
                    self.child.kill()?;
                    self.child.wait()?
                }
            }
        } else {
            if let Some(quit) = quit {
                if self.child.try_wait()?.is_none() {
                    self.send_line(quit).ok();
                }
            }

            drop(self.stdin.take());
            self.wait_for_exit()?
        };

        debug!("{} exited with {status}", self.program);

        self.stdin = None;
        self.status = Some(status);
        Ok(status)
    }
}

impl Drop for DialogueSession {
    fn drop(&mut self) {
        if let Err(e) = self.close(None) {
            error!("Couldn't reap {}: {e}", self.program);
        }
    }
}
