//! Structured privileged commands.
//!
//! A [`PrivilegedCommand`] is a program from a closed set plus an argument
//! list. Arguments are validated against a conservative character set when
//! the command is rendered, so no argument can smuggle shell syntax into the
//! `su -c` string.

use std::fmt;

use super::error::CommandError;

/// Programs appfence is allowed to run with elevated privileges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    /// Packet filter.
    Iptables,
    /// Link, address, rule and route management.
    Ip,
    /// Traffic control.
    Tc,
    /// Process listing.
    Ps,
    /// Android settings provider.
    Settings,
    /// Identity query used to probe for root.
    Id,
}

impl Program {
    /// Executable name.
    pub fn binary(self) -> &'static str {
        match self {
            Program::Iptables => "iptables",
            Program::Ip => "ip",
            Program::Tc => "tc",
            Program::Ps => "ps",
            Program::Settings => "settings",
            Program::Id => "id",
        }
    }
}

/// A single command to run as the superuser.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrivilegedCommand {
    /// Program to run.
    pub program: Program,
    /// Arguments, one element per argv entry.
    pub args: Vec<String>,
}

impl PrivilegedCommand {
    /// Create a command from a program and its arguments.
    pub fn new<I, S>(program: Program, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Shorthand for an `iptables` command.
    pub fn iptables<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Program::Iptables, args)
    }

    /// Shorthand for an `ip` command.
    pub fn ip<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Program::Ip, args)
    }

    /// Shorthand for a `tc` command.
    pub fn tc<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Program::Tc, args)
    }

    /// Render the command as a single shell string.
    ///
    /// Fails if any argument contains characters outside
    /// `[A-Za-z0-9._:/,=+@%-]` or is empty.
    pub fn render(&self) -> Result<String, CommandError> {
        let mut out = String::from(self.program.binary());
        for arg in &self.args {
            if !is_safe_arg(arg) {
                return Err(CommandError::UnsafeArgument {
                    program: self.program.binary(),
                    arg: arg.clone(),
                });
            }
            out.push(' ');
            out.push_str(arg);
        }
        Ok(out)
    }

    /// For an `iptables` append (`-A`) or insert (`-I`), build the matching
    /// delete (`-D`) with identical rule arguments.
    ///
    /// Returns `None` for anything that is not an iptables append/insert.
    pub fn to_delete(&self) -> Option<PrivilegedCommand> {
        if self.program != Program::Iptables {
            return None;
        }
        let verb_idx = self.args.iter().position(|a| a == "-A" || a == "-I")?;
        let mut args = self.args.clone();
        let is_insert = args[verb_idx] == "-I";
        args[verb_idx] = "-D".to_string();
        // `-I CHAIN 1 ...` carries a position that `-D` does not accept.
        if is_insert
            && args.len() > verb_idx + 2
            && args[verb_idx + 2].chars().all(|c| c.is_ascii_digit())
        {
            args.remove(verb_idx + 2);
        }
        Some(PrivilegedCommand {
            program: self.program,
            args,
        })
    }
}

impl fmt::Display for PrivilegedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.binary())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn is_safe_arg(arg: &str) -> bool {
    !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '.' | '_' | ':' | '/' | ',' | '=' | '+' | '@' | '%' | '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_joins_arguments() {
        let cmd = PrivilegedCommand::iptables(["-A", "appfence", "-j", "DROP"]);
        assert_eq!(cmd.render().unwrap(), "iptables -A appfence -j DROP");
    }

    #[test]
    fn test_render_rejects_shell_metacharacters() {
        for bad in ["a;b", "$(id)", "x y", "`id`", "a'b", "a|b", ""] {
            let cmd = PrivilegedCommand::ip(["link", bad]);
            assert!(
                matches!(cmd.render(), Err(CommandError::UnsafeArgument { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_render_accepts_interface_globs_and_cidrs() {
        let cmd = PrivilegedCommand::iptables(["-o", "wlan+", "-d", "10.0.0.0/8"]);
        assert!(cmd.render().is_ok());
    }

    #[test]
    fn test_append_converts_to_delete() {
        let cmd = PrivilegedCommand::iptables([
            "-A", "appfence", "-m", "owner", "--uid-owner", "10001", "-j", "DROP",
        ]);
        let del = cmd.to_delete().unwrap();
        assert_eq!(
            del.args,
            vec!["-D", "appfence", "-m", "owner", "--uid-owner", "10001", "-j", "DROP"]
        );
    }

    #[test]
    fn test_insert_with_position_converts_to_delete() {
        let cmd = PrivilegedCommand::iptables(["-I", "OUTPUT", "1", "-j", "appfence"]);
        let del = cmd.to_delete().unwrap();
        assert_eq!(del.args, vec!["-D", "OUTPUT", "-j", "appfence"]);
    }

    #[test]
    fn test_non_iptables_has_no_delete() {
        let cmd = PrivilegedCommand::ip(["link", "add", "x", "type", "dummy"]);
        assert!(cmd.to_delete().is_none());
    }
}
