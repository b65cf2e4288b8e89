//! # Commands
//!
//! Purpose: Carry a command name and its binary-safe arguments from the
//! argument encoders to the dispatcher.
//!
//! ## Design Principles
//! 1. **Immutable After Build**: The builder consumes `self`; a finished
//!    `Command` exposes read-only accessors only.
//! 2. **Binary-Safe**: Name and arguments are `Bytes`, never `String`.
//! 3. **Cheap Clones**: `Bytes` is reference counted, so retrying a command
//!    after a redirect does not copy payloads.

use std::fmt;

use bytes::Bytes;

/// A command ready for dispatch: `name arg1 arg2 ...`.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    name: Bytes,
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with the given name and no arguments.
    pub fn new(name: impl Into<Bytes>) -> Self {
        Command {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Builds a command from a name and an argument list in one go.
    pub fn with_args<I, A>(name: impl Into<Bytes>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        Command {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds a command from a raw token list where the first token is the name.
    ///
    /// Returns `None` for an empty list.
    pub fn from_tokens<I, A>(tokens: I) -> Option<Self>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        let mut iter = tokens.into_iter().map(Into::into);
        let name = iter.next()?;
        Some(Command {
            name,
            args: iter.collect(),
        })
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends an integer argument in its decimal form.
    pub fn arg_int(self, value: i64) -> Self {
        self.arg(value.to_string())
    }

    /// Raw command name as supplied by the encoder.
    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Ordered arguments, not including the name.
    #[inline]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Argument at `idx`, if present.
    #[inline]
    pub fn arg_at(&self, idx: usize) -> Option<&[u8]> {
        self.args.get(idx).map(|a| a.as_ref())
    }

    /// Upper-cased command name, lossy for non-UTF-8 names.
    pub fn name_upper(&self) -> String {
        String::from_utf8_lossy(&self.name).to_ascii_uppercase()
    }

    /// Name plus subcommand for container commands (`CONFIG SET`, `CLUSTER SLOTS`).
    ///
    /// Falls back to the bare name when there is no first argument.
    pub fn full_name(&self) -> String {
        let name = self.name_upper();
        match self.args.first() {
            Some(sub) => format!("{} {}", name, String::from_utf8_lossy(sub).to_ascii_uppercase()),
            None => name,
        }
    }

    /// Number of frames this command occupies on the wire (name + args).
    #[inline]
    pub fn frame_len(&self) -> usize {
        self.args.len() + 1
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Arguments can hold user payloads; print the shape only.
        write!(
            f,
            "Command({}, {} args)",
            String::from_utf8_lossy(&self.name),
            self.args.len()
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_argument_order() {
        let cmd = Command::new("SET").arg("key").arg("value").arg("EX").arg_int(10);
        assert_eq!(cmd.name(), b"SET");
        assert_eq!(cmd.args().len(), 4);
        assert_eq!(cmd.arg_at(0), Some(&b"key"[..]));
        assert_eq!(cmd.arg_at(3), Some(&b"10"[..]));
        assert_eq!(cmd.frame_len(), 5);
    }

    #[test]
    fn test_from_tokens() {
        let cmd = Command::from_tokens(vec!["config", "get", "maxmemory"]).expect("command");
        assert_eq!(cmd.name_upper(), "CONFIG");
        assert_eq!(cmd.full_name(), "CONFIG GET");
        assert!(Command::from_tokens(Vec::<Bytes>::new()).is_none());
    }

    #[test]
    fn test_debug_hides_payload() {
        let cmd = Command::new("SET").arg("secret-key").arg("secret-value");
        let printed = format!("{:?}", cmd);
        assert!(!printed.contains("secret"));
        assert!(printed.contains("2 args"));
    }
}
