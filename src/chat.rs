use anyhow::{bail, Result};
use async_trait::async_trait;
use std::io::{BufRead, Write};
use tracing::debug;

use crate::api::{Content, GenerativeModel};

/// Sent once, before the operator types anything.
pub const GREETING: &str = "Hello!! How are you?";

/// Ends the chat when typed on its own, in any letter case.
pub const EXIT_KEYWORD: &str = "exit";

const RESPONDER_LABEL: &str = "Gemini";
const PROMPT_LABEL: &str = "You";
const BANNER: &str = "Chat with Gemini!! Type 'exit' to end the chat.";
const FAREWELL: &str = "Ending the chat. Goodbye!";

/// A multi-turn conversation: submit text, receive the reply.
#[async_trait(?Send)]
pub trait Conversation {
    /// Sends `text` as the next user turn. `on_chunk` receives the reply as it
    /// arrives; the chunks concatenate to the returned reply.
    async fn send_message(
        &mut self,
        text: &str,
        on_chunk: &mut dyn for<'a> FnMut(&'a str) -> Result<()>,
    ) -> Result<String>;
}

/// The one conversation a process holds with the model.
///
/// The API keeps no state between calls, so the session owns the history and
/// resends it on every turn. A turn is recorded only once its reply arrived.
pub struct ChatSession<M: GenerativeModel> {
    model: M,
    history: Vec<Content>,
}

impl<M: GenerativeModel> ChatSession<M> {
    pub fn start(model: M) -> Self {
        ChatSession {
            model,
            history: Vec::new(),
        }
    }
}

#[async_trait(?Send)]
impl<M: GenerativeModel> Conversation for ChatSession<M> {
    async fn send_message(
        &mut self,
        text: &str,
        on_chunk: &mut dyn for<'a> FnMut(&'a str) -> Result<()>,
    ) -> Result<String> {
        self.history.push(Content::user(text));

        match self.model.generate(&self.history, on_chunk).await {
            Ok(reply) => {
                self.history.push(Content::model(reply.clone()));
                Ok(reply)
            }
            Err(e) => {
                self.history.pop();
                Err(e)
            }
        }
    }
}

/// Drives the greeting and then the read/forward/print loop until the exit
/// keyword is typed. Any error ends the loop and is returned as is.
pub struct ChatRepl<C: Conversation> {
    conversation: C,
}

impl<C: Conversation> ChatRepl<C> {
    pub fn new(conversation: C) -> Self {
        ChatRepl { conversation }
    }

    pub async fn run<R: BufRead, W: Write>(&mut self, mut input: R, mut output: W) -> Result<()> {
        self.exchange(GREETING, &mut output).await?;
        writeln!(output, "{}", BANNER)?;

        loop {
            write!(output, "{}: ", PROMPT_LABEL)?;
            output.flush()?;

            let line = read_line(&mut input)?;
            if is_exit_keyword(&line) {
                writeln!(output, "{}", FAREWELL)?;
                output.flush()?;
                debug!("exit keyword received");
                return Ok(());
            }

            self.exchange(&line, &mut output).await?;
        }
    }

    /// Forwards `text` and prints the labeled reply, chunk by chunk if the
    /// conversation streams.
    async fn exchange<W: Write>(&mut self, text: &str, output: &mut W) -> Result<()> {
        let mut labeled = false;
        let mut print_chunk = |chunk: &str| -> Result<()> {
            if !labeled {
                write!(output, "{}: ", RESPONDER_LABEL)?;
                labeled = true;
            }
            write!(output, "{}", chunk)?;
            output.flush()?;
            Ok(())
        };

        self.conversation.send_message(text, &mut print_chunk).await?;

        if !labeled {
            write!(output, "{}: ", RESPONDER_LABEL)?;
        }
        writeln!(output)?;
        output.flush()?;
        Ok(())
    }

    #[cfg(test)]
    fn into_inner(self) -> C {
        self.conversation
    }
}

fn is_exit_keyword(line: &str) -> bool {
    line.to_lowercase() == EXIT_KEYWORD
}

/// Reads one line without its terminator. Running out of input is an error.
fn read_line<R: BufRead>(input: &mut R) -> Result<String> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        bail!("unexpected end of input");
    }

    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(line)
}
