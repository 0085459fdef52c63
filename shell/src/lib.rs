//! `msh`, a small interactive command interpreter.
//!
//! Each input line goes through one cycle: the standard streams are
//! redirected for the whole line, every argument is expanded (globs, then
//! `$name` and `~user`), the pipeline runs, and the streams are put back.
//! Only `cd`, `umask`, `time` and `read` are built in; everything else is
//! looked up on `PATH` and executed.
//!
//! The main entry point is [`Interpreter`]. The public modules [`command`]
//! and [`env`] expose the parsed-line data model and the execution context.

mod builtin;
pub mod command;
pub mod env;
mod expand;
mod external;
mod interpreter;
mod io_adapters;
mod lexer;
mod parser;
mod pipeline;
mod process;
mod redirect;

pub use expand::{ExpandError, SystemUsers, UserDirectory};
pub use interpreter::{CycleError, Interpreter};
pub use parser::{ParseError, parse_line};
pub use redirect::RedirectError;
