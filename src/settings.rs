use lexopt::prelude::*;
use pybridge_cpyext::TypeInitPolicy;

pub const USAGE: &str = "\
usage: pybridge [OPTIONS] COMMAND

commands:
  layout       print offsets and sizes of the native object headers
  functions    list the functions native code can call
  check        start a bridge and run a round-trip self check

options:
  -v, --verbose            more logging (repeatable)
      --type-init MODE     eager or lazy descriptor synthesis (check)
      --exported           only list functions with a C symbol (functions)
  -h, --help               show this help";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Layout,
    Functions,
    Check,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opts {
    pub command: Command,
    pub verbose: u8,
    pub type_init: Option<TypeInitPolicy>,
    pub exported_only: bool,
}

impl Opts {
    /// The `env_logger` filter used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

pub fn parse_args(mut parser: lexopt::Parser) -> Result<Opts, lexopt::Error> {
    let mut command = None;
    let mut verbose = 0u8;
    let mut type_init = None;
    let mut exported_only = false;
    while let Some(arg) = parser.next()? {
        match arg {
            Short('v') | Long("verbose") => verbose = verbose.saturating_add(1),
            Long("type-init") => type_init = Some(parser.value()?.parse()?),
            Long("exported") => exported_only = true,
            Short('h') | Long("help") => command = Some(Command::Help),
            Value(value) if command.is_none() => {
                let value = value.string()?;
                command = Some(match value.as_str() {
                    "layout" => Command::Layout,
                    "functions" => Command::Functions,
                    "check" => Command::Check,
                    _ => return Err(format!("unknown command '{value}'").into()),
                });
            }
            _ => return Err(arg.unexpected()),
        }
    }
    Ok(Opts {
        command: command.ok_or("missing command")?,
        verbose,
        type_init,
        exported_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Opts, lexopt::Error> {
        parse_args(lexopt::Parser::from_args(args.iter().copied()))
    }

    #[test]
    fn test_commands() {
        let opts = parse(&["functions", "--exported", "-vv"]).unwrap();
        assert_eq!(opts.command, Command::Functions);
        assert!(opts.exported_only);
        assert_eq!(opts.log_filter(), "debug");

        let opts = parse(&["--type-init", "eager", "check"]).unwrap();
        assert_eq!(opts.command, Command::Check);
        assert_eq!(opts.type_init, Some(TypeInitPolicy::Eager));

        assert_eq!(parse(&["-h"]).unwrap().command, Command::Help);
    }

    #[test]
    fn test_errors() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
        assert!(parse(&["layout", "extra"]).is_err());
        assert!(parse(&["check", "--type-init", "sometimes"]).is_err());
        assert!(parse(&["check", "--bogus"]).is_err());
    }
}
