//! Turns a command line into a [`ParsedLine`].
//!
//! Grammar: `command ('|' command)* ['&']`, where every command is one or
//! more words and `<file`, `>file`, `>&file` may appear anywhere after the
//! first word of any command. Each redirection applies to the whole pipeline
//! and may be given at most once.

use crate::command::{Command, ParsedLine, Pipeline, RedirectionSpec, Stream};
use crate::lexer::{self, LexingError, Token};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building a [`ParsedLine`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lexing(#[from] LexingError),
    /// A pipeline stage without any word (`| cmd`, `cmd |`, `a || b`, `> f`).
    #[error("empty command in pipeline")]
    EmptyCommand,
    #[error("missing file name after redirection of {0}")]
    MissingRedirectTarget(Stream),
    #[error("{0} redirected more than once")]
    DuplicateRedirect(Stream),
    #[error("`&` is only allowed at the end of a line")]
    MisplacedBackground,
}

struct LineBuilder {
    tokens: Vec<Token>,
    pos: usize,
    redirection: RedirectionSpec,
}

impl LineBuilder {
    fn from(tokens: Vec<Token>) -> Self {
        LineBuilder {
            tokens,
            pos: 0,
            redirection: RedirectionSpec::default(),
        }
    }

    fn build(mut self) -> Result<ParsedLine, ParseError> {
        let background = self.take_background()?;

        let mut commands = vec![self.parse_command()?];
        while self.consume().is_some() {
            // Only `|` can stop a command before the end.
            commands.push(self.parse_command()?);
        }

        let pipeline = Pipeline::new(commands).ok_or(ParseError::EmptyCommand)?;
        Ok(ParsedLine {
            pipeline,
            redirection: self.redirection,
            background,
        })
    }

    /// Strip a trailing `&`; any other `&` is an error.
    fn take_background(&mut self) -> Result<bool, ParseError> {
        let background = self.tokens.last() == Some(&Token::Background);
        if background {
            self.tokens.pop();
        }
        if self.tokens.contains(&Token::Background) {
            return Err(ParseError::MisplacedBackground);
        }
        Ok(background)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Words and redirections up to the next `|` or the end of the line.
    fn parse_command(&mut self) -> Result<Command, ParseError> {
        let mut argv = Vec::new();
        loop {
            let stream = match self.peek() {
                None | Some(Token::Pipe) => break,
                Some(Token::Word(_)) => {
                    if let Some(Token::Word(w)) = self.consume() {
                        argv.push(w);
                    }
                    continue;
                }
                Some(Token::RedirectIn) => Stream::Input,
                Some(Token::RedirectOut) => Stream::Output,
                Some(Token::RedirectErr) => Stream::Error,
                Some(Token::Background) => return Err(ParseError::MisplacedBackground),
            };
            if argv.is_empty() {
                return Err(ParseError::EmptyCommand);
            }
            self.consume();
            self.parse_redirect(stream)?;
        }
        Command::new(argv).ok_or(ParseError::EmptyCommand)
    }

    fn parse_redirect(&mut self, stream: Stream) -> Result<(), ParseError> {
        let target = match self.consume() {
            Some(Token::Word(w)) if !w.is_empty() => PathBuf::from(w),
            _ => return Err(ParseError::MissingRedirectTarget(stream)),
        };
        let slot = self.redirection.slot_mut(stream);
        if slot.is_some() {
            return Err(ParseError::DuplicateRedirect(stream));
        }
        *slot = Some(target);
        Ok(())
    }
}

/// Parse one input line.
///
/// Returns `Ok(None)` for a line with no tokens at all.
pub fn parse_line(line: &str) -> Result<Option<ParsedLine>, ParseError> {
    let tokens = lexer::split_into_tokens(line)?;
    if tokens.is_empty() {
        return Ok(None);
    }
    LineBuilder::from(tokens).build().map(Some)
}
