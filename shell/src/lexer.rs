//! Lexical analysis of one command line.
//!
//! Words are separated by blanks; single and double quotes group characters
//! (operators and blanks included) into one word and are removed. Nothing is
//! substituted here: `$name` and `~user` reach the expander untouched.

use thiserror::Error;

/// A token produced by [`split_into_tokens`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A word with its quotes removed.
    Word(String),
    /// `|`
    Pipe,
    /// `<`
    RedirectIn,
    /// `>`
    RedirectOut,
    /// `>&`, standard error to a file.
    RedirectErr,
    /// `&`
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexingError {
    /// A closing quote (single or double) was not found.
    #[error("unterminated {0} quote")]
    UnfinishedQuote(char),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexingState {
    Start,
    ReadingWord,
    ReadingQuote(char),
}

struct LexingFSM {
    input: Vec<char>,
    pos: usize,
    state: LexingState,
    buffer: String,
}

impl LexingFSM {
    fn new(line: &str) -> Self {
        LexingFSM {
            input: line.chars().collect(),
            pos: 0,
            state: LexingState::Start,
            buffer: String::new(),
        }
    }

    fn make_tokens(&mut self) -> Result<Vec<Token>, LexingError> {
        let mut out = Vec::new();

        while let Some(ch) = self.read_char() {
            match self.state {
                LexingState::Start | LexingState::ReadingWord => self.handle_unquoted(ch, &mut out),
                LexingState::ReadingQuote(quote) => self.handle_quote(ch, quote),
            }
        }

        if let LexingState::ReadingQuote(quote) = self.state {
            return Err(LexingError::UnfinishedQuote(quote));
        }
        self.finish_word(&mut out);
        Ok(out)
    }

    fn read_char(&mut self) -> Option<char> {
        let ch = self.input.get(self.pos).copied();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn peek_char(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn handle_unquoted(&mut self, ch: char, out: &mut Vec<Token>) {
        let operator = match ch {
            '|' => Some(Token::Pipe),
            '<' => Some(Token::RedirectIn),
            '>' if self.peek_char() == Some('&') => {
                self.read_char();
                Some(Token::RedirectErr)
            }
            '>' => Some(Token::RedirectOut),
            '&' => Some(Token::Background),
            _ => None,
        };
        if let Some(token) = operator {
            self.finish_word(out);
            out.push(token);
            return;
        }

        match ch {
            c if c.is_whitespace() => self.finish_word(out),
            '\'' | '"' => self.state = LexingState::ReadingQuote(ch),
            c => {
                self.buffer.push(c);
                self.state = LexingState::ReadingWord;
            }
        }
    }

    fn handle_quote(&mut self, ch: char, quote: char) {
        if ch == quote {
            // `''` still makes a (possibly empty) word.
            self.state = LexingState::ReadingWord;
        } else {
            self.buffer.push(ch);
        }
    }

    fn finish_word(&mut self, out: &mut Vec<Token>) {
        if self.state == LexingState::ReadingWord {
            out.push(Token::Word(std::mem::take(&mut self.buffer)));
        }
        self.state = LexingState::Start;
    }
}

/// Split `line` into words and operators.
pub fn split_into_tokens(line: &str) -> Result<Vec<Token>, LexingError> {
    LexingFSM::new(line).make_tokens()
}
