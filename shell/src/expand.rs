//! Word expansion: pathname globbing, then `$name` and `~user` substitution.
//!
//! Expansion never changes the number of arguments. A glob that matches
//! several entries becomes one argument with the matches joined by a single
//! space; this is a known limitation of the interpreter, not an accident.

use crate::command::Pipeline;
use crate::env::Environment;
use glob::MatchOptions;
use nix::unistd::User;
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use thiserror::Error;

/// Characters allowed in variable and user names after `$` or `~`.
static IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9_]+").expect("identifier pattern is valid"));

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("~{0}: no such user")]
    UnknownUser(String),
}

/// Source of other users' home directories for `~name`.
pub trait UserDirectory {
    fn home_dir(&self, user: &str) -> Option<PathBuf>;
}

/// Looks users up in the system password database.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUsers;

impl UserDirectory for SystemUsers {
    fn home_dir(&self, user: &str) -> Option<PathBuf> {
        match User::from_name(user) {
            Ok(found) => found.map(|u| u.dir),
            Err(e) => {
                tracing::warn!("user lookup for {user} failed: {e}");
                None
            }
        }
    }
}

/// Rewrite every argument of every command in place.
///
/// Stops at the first unknown `~user`; tokens already rewritten stay rewritten,
/// which is harmless because the cycle is abandoned.
pub fn expand_pipeline(
    pipeline: &mut Pipeline,
    env: &Environment,
    users: &dyn UserDirectory,
) -> Result<(), ExpandError> {
    for command in pipeline.commands_mut() {
        for token in command.argv_mut() {
            *token = expand_word(token, env, users)?;
        }
    }
    Ok(())
}

/// Pathname expansion followed by variable and tilde substitution.
pub fn expand_word(
    token: &str,
    env: &Environment,
    users: &dyn UserDirectory,
) -> Result<String, ExpandError> {
    let globbed = expand_pathname(token);
    substitute(&globbed, env, users)
}

fn has_glob_meta(token: &str) -> bool {
    token.contains(['*', '?', '['])
}

/// Replace a glob pattern by its matches joined with spaces.
///
/// Patterns that match nothing, or are not valid patterns, come back unchanged.
pub fn expand_pathname(token: &str) -> String {
    if !has_glob_meta(token) {
        return token.to_string();
    }
    let paths = match glob::glob_with(token, GLOB_OPTIONS) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::debug!("not a glob pattern {token:?}: {e}");
            return token.to_string();
        }
    };
    let matches: Vec<String> = paths
        .filter_map(Result::ok)
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    if matches.is_empty() {
        token.to_string()
    } else {
        matches.join(" ")
    }
}

/// Substitute `$name`, `~name` and `~` left to right.
///
/// - `$name` takes the longest run of `[A-Za-z0-9_]`; unset variables become
///   the empty string. A `$` with no name after it stays literal.
/// - `~name` becomes that user's home directory, or fails the expansion.
/// - `~` not followed by a name character becomes `HOME` (empty if unset).
///
/// Substituted text is never scanned again.
pub fn substitute(
    token: &str,
    env: &Environment,
    users: &dyn UserDirectory,
) -> Result<String, ExpandError> {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(pos) = rest.find(['$', '~']) {
        out.push_str(&rest[..pos]);
        let sigil = &rest[pos..pos + 1];
        let after = &rest[pos + 1..];
        let name = IDENT.find(after).map_or("", |m| m.as_str());
        match (sigil, name) {
            ("$", "") => out.push('$'),
            ("$", name) => out.push_str(env.get_var(name).unwrap_or_default()),
            (_, "") => out.push_str(env.home().unwrap_or_default()),
            (_, user) => {
                let home = users
                    .home_dir(user)
                    .ok_or_else(|| ExpandError::UnknownUser(user.to_string()))?;
                out.push_str(&home.to_string_lossy());
            }
        }
        rest = &after[name.len()..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use std::collections::HashMap;
    use std::fs;

    struct FakeUsers(HashMap<&'static str, &'static str>);

    impl UserDirectory for FakeUsers {
        fn home_dir(&self, user: &str) -> Option<PathBuf> {
            self.0.get(user).map(PathBuf::from)
        }
    }

    fn users() -> FakeUsers {
        FakeUsers(HashMap::from([("alice", "/home/alice")]))
    }

    fn env_with(pairs: &[(&str, &str)]) -> Environment {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_vars(vars, PathBuf::from("/"))
    }

    fn sub(token: &str, env: &Environment) -> String {
        substitute(token, env, &users()).unwrap()
    }

    #[test]
    fn variable_is_replaced() {
        let env = env_with(&[("FOO", "bar")]);
        assert_eq!(sub("$FOO", &env), "bar");
        assert_eq!(sub("a$FOO b", &env), "abar b");
        assert_eq!(sub("$FOO/$FOO", &env), "bar/bar");
    }

    #[test]
    fn unset_variable_becomes_empty() {
        let env = env_with(&[]);
        assert_eq!(sub("$UNSET_VAR_X", &env), "");
        assert_eq!(sub("x$UNSET_VAR_X.y", &env), "x.y");
    }

    #[test]
    fn name_is_longest_identifier_run() {
        let env = env_with(&[("HOME", "/h"), ("HOME_post", "long")]);
        assert_eq!(sub("pre$HOME_post", &env), "prelong");
        assert_eq!(sub("pre$HOME-post", &env), "pre/h-post");
    }

    #[test]
    fn lone_dollar_stays_literal() {
        let env = env_with(&[]);
        assert_eq!(sub("cost: 5$", &env), "cost: 5$");
        assert_eq!(sub("$-x", &env), "$-x");
    }

    #[test]
    fn substituted_text_is_not_rescanned() {
        let env = env_with(&[("A", "$B"), ("B", "nope")]);
        assert_eq!(sub("$A", &env), "$B");
    }

    #[test]
    fn tilde_alone_is_home() {
        let env = env_with(&[("HOME", "/home/me")]);
        assert_eq!(sub("~", &env), "/home/me");
        assert_eq!(sub("~/docs", &env), "/home/me/docs");
        assert_eq!(sub("~ x", &env), "/home/me x");
    }

    #[test]
    fn tilde_without_home_is_empty() {
        let env = env_with(&[]);
        assert_eq!(sub("~/docs", &env), "/docs");
    }

    #[test]
    fn tilde_user_is_looked_up() {
        let env = env_with(&[("HOME", "/home/me")]);
        assert_eq!(sub("~alice/notes", &env), "/home/alice/notes");
    }

    #[test]
    fn unknown_user_is_an_error() {
        let env = env_with(&[]);
        let err = substitute("~nobody_here_42", &env, &users()).unwrap_err();
        assert!(matches!(err, ExpandError::UnknownUser(ref u) if u == "nobody_here_42"));
    }

    #[test]
    fn mixed_substitutions_apply_left_to_right() {
        let env = env_with(&[("HOME", "/h"), ("D", "src")]);
        assert_eq!(sub("~/$D:~alice", &env), "/h/src:/home/alice");
    }

    #[test]
    fn pathname_without_match_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/*.nothing", dir.path().display());
        assert_eq!(expand_pathname(&pattern), pattern);
    }

    #[test]
    fn pathname_matches_are_joined_into_one_token() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), "").unwrap();
        fs::write(dir.path().join("b"), "").unwrap();
        fs::write(dir.path().join(".hidden"), "").unwrap();
        let base = dir.path().display();
        let expanded = expand_pathname(&format!("{base}/*"));
        assert_eq!(expanded, format!("{base}/a {base}/b"));
    }

    #[test]
    fn plain_words_are_not_globbed() {
        assert_eq!(expand_pathname("hello"), "hello");
        assert_eq!(expand_pathname("[unclosed"), "[unclosed");
    }

    #[test]
    fn pipeline_tokens_are_rewritten_in_place() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), "").unwrap();
        let env = env_with(&[("WHO", "world")]);
        let mut pipeline = Pipeline::new(vec![
            Command::new(vec!["echo".into(), "hello".into(), "$WHO".into()]).unwrap(),
            Command::new(vec![
                "ls".into(),
                format!("{}/*.txt", dir.path().display()),
            ])
            .unwrap(),
        ])
        .unwrap();

        expand_pipeline(&mut pipeline, &env, &users()).unwrap();

        assert_eq!(pipeline.commands()[0].argv(), ["echo", "hello", "world"]);
        assert_eq!(
            pipeline.commands()[1].argv()[1],
            format!("{}/x.txt", dir.path().display())
        );
    }

    #[test]
    fn system_users_know_root() {
        assert!(SystemUsers.home_dir("root").is_some());
        assert_eq!(SystemUsers.home_dir("no_such_user_for_msh_tests"), None);
    }
}
