use core::fmt;

use log::debug;
use regex::Regex;
use types::DialogueError;

use crate::session::DialogueSession;

/// A prompt printed by an interactive program when it waits for an answer.
///
/// A prompt only matches at the very end of the program output, since the program stops
/// printing once it waits for input.
pub struct Prompt {
    name: &'static str,
    pattern: Regex,
}

impl Prompt {
    /// Creates a new prompt out of a regular expression
    ///
    /// # Panics
    ///
    /// If the pattern isn't a valid regular expression
    #[must_use]
    pub fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            pattern: Regex::new(&format!(r"(?:{pattern})\z"))
                .unwrap_or_else(|e| panic!("Invalid prompt pattern {pattern:?}: {e}")),
        }
    }

    /// Prompt name, used in logs and errors
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the start and end offsets of the prompt if the output ends with it
    #[must_use]
    pub fn find(&self, output: &str) -> Option<(usize, usize)> {
        self.pattern.find(output).map(|m| (m.start(), m.end()))
    }

    pub(crate) fn describe(prompts: &[&Self]) -> String {
        prompts
            .iter()
            .map(|p| p.name)
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prompt")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

/// What a [`Step`] waits for
#[derive(Clone, Copy, Debug)]
pub enum Expect {
    /// A prompt
    Prompt(&'static Prompt),

    /// The program closing its output
    Eof,
}

/// One transition of a [`Script`]: wait for something, then optionally answer it
#[derive(Debug)]
pub struct Step {
    expect: Expect,
    reply: Option<String>,
}

impl Step {
    /// Waits for a prompt and answers it
    #[must_use]
    pub fn answer(prompt: &'static Prompt, reply: impl Into<String>) -> Self {
        Self {
            expect: Expect::Prompt(prompt),
            reply: Some(reply.into()),
        }
    }

    /// Waits for a prompt, and leaves it unanswered
    #[must_use]
    pub fn wait(prompt: &'static Prompt) -> Self {
        Self {
            expect: Expect::Prompt(prompt),
            reply: None,
        }
    }

    /// Waits for the program to close its output
    #[must_use]
    pub fn eof() -> Self {
        Self {
            expect: Expect::Eof,
            reply: None,
        }
    }
}

/// A scripted exchange with an interactive program.
///
/// The script optionally sends a command, then goes through its steps in order. While waiting
/// for a step, any of the interjections (confirmations, warnings) can show up and gets answered
/// without moving on to the next step.
#[derive(Debug, Default)]
pub struct Script {
    command: Option<String>,
    steps: Vec<Step>,
    interjections: Vec<(&'static Prompt, String)>,
}

impl Script {
    /// Creates a script starting with a command
    #[must_use]
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }

    /// Creates a script that doesn't do anything
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds a step to the script
    #[must_use]
    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Answers a prompt whenever it shows up while waiting for the next step
    #[must_use]
    pub fn on(mut self, prompt: &'static Prompt, reply: impl Into<String>) -> Self {
        self.interjections.push((prompt, reply.into()));
        self
    }

    /// Whether the program is expected to be gone once the script is over
    #[must_use]
    pub fn ends_at_eof(&self) -> bool {
        matches!(self.steps.last(), Some(Step { expect: Expect::Eof, .. }))
    }

    /// Lines sent by the script when no interjection shows up
    #[must_use]
    pub fn replies(&self) -> Vec<&str> {
        self.command
            .iter()
            .map(String::as_str)
            .chain(self.steps.iter().filter_map(|s| s.reply.as_deref()))
            .collect()
    }

    /// Runs the script, and returns the program output that didn't belong to any prompt
    ///
    /// # Errors
    ///
    /// If any of the steps fail.
    pub fn run(&self, session: &mut DialogueSession) -> Result<String, DialogueError> {
        let mut transcript = String::new();

        if let Some(command) = &self.command {
            session.send_line(command)?;
        }

        for step in &self.steps {
            let prompt = match step.expect {
                Expect::Eof => {
                    transcript.push_str(&session.expect_eof()?);
                    continue;
                }
                Expect::Prompt(prompt) => prompt,
            };

            let mut prompts = vec![prompt];
            prompts.extend(self.interjections.iter().map(|(p, _)| *p));

            loop {
                let matched = session.expect(&prompts)?;
                transcript.push_str(&matched.before);

                if matched.index == 0 {
                    if let Some(reply) = &step.reply {
                        session.send_line(reply)?;
                    }

                    break;
                }

                let (interjection, reply) = &self.interjections[matched.index - 1];
                debug!(
                    "{}: answering {} with {reply:?}",
                    session.program(),
                    interjection.name()
                );

                session.send_line(reply)?;
            }
        }

        Ok(transcript)
    }
}
