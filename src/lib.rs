//! The `pybridge` binary: inspects the native object bridge without an
//! extension module attached.
//!
//! ```text
//! pybridge layout          # header offsets native code is compiled against
//! pybridge functions       # the API table, with error and lock conventions
//! pybridge check -v        # start a bridge and run a round-trip self check
//! ```

#[macro_use]
extern crate log;

mod settings;

use pybridge_cpyext::{ApiFunction, Bridge, PyObjectPtr, Settings, abi, api::ErrorValue};
use pybridge_vm::Heap;
use settings::{Command, Opts, USAGE, parse_args};
use std::{error::Error, io, process::ExitCode, sync::Arc};

pub fn run() -> ExitCode {
    let opts = match parse_args(lexopt::Parser::from_env()) {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("error: {err}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(opts.log_filter()))
        .init();

    let mut stdout = io::stdout().lock();
    match run_command(&opts, &mut stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run_command(opts: &Opts, out: &mut impl io::Write) -> Result<(), Box<dyn Error>> {
    match opts.command {
        Command::Help => writeln!(out, "{USAGE}")?,
        Command::Layout => print_layout(out)?,
        Command::Functions => print_functions(out, opts.exported_only)?,
        Command::Check => {
            let mut settings = Settings::from_env();
            if let Some(policy) = opts.type_init {
                settings = settings.with_type_init(policy);
            }
            let report = self_check(settings)?;
            writeln!(out, "{report}")?;
        }
    }
    Ok(())
}

fn print_layout(out: &mut impl io::Write) -> io::Result<()> {
    writeln!(out, "{:<14} {:<18} {:>6} {:>4}", "struct", "field", "offset", "size")?;
    for row in abi::header_layout() {
        writeln!(
            out,
            "{:<14} {:<18} {:>6} {:>4}",
            row.struct_name, row.field, row.offset, row.size
        )?;
    }
    Ok(())
}

fn all_functions() -> impl Iterator<Item = &'static ApiFunction> {
    pybridge_cpyext::FUNCTIONS
        .iter()
        .chain(pybridge_capi::FUNCTIONS)
        .copied()
}

fn print_functions(out: &mut impl io::Write, exported_only: bool) -> io::Result<()> {
    for func in all_functions().filter(|func| !exported_only || func.export.is_some()) {
        let error = match func.error {
            ErrorValue::Null => "NULL".to_owned(),
            ErrorValue::Int(value) => value.to_string(),
            ErrorValue::CannotFail => "-".to_owned(),
        };
        writeln!(
            out,
            "{:<28} {:<22} args={:?} ret={:?} error={error} gil={:?}",
            func.export.unwrap_or("<internal>"),
            func.name,
            func.args,
            func.ret,
            func.gil,
        )?;
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CheckReport {
    types: usize,
    links: usize,
    released: usize,
}

impl core::fmt::Display for CheckReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "ok: {} type descriptors, {} links live, {} released",
            self.types, self.links, self.released
        )
    }
}

/// Mirrors every builtin type, sends a tuple across and back, then collects
/// and checks the mirrors of unreachable objects were released.
fn self_check(settings: Settings) -> Result<CheckReport, Box<dyn Error>> {
    let bridge = Bridge::new(Arc::new(Heap::new()), settings)?;
    bridge.enter(|| -> Result<_, Box<dyn Error>> {
        let heap = &bridge.heap;
        let mut report = CheckReport::default();
        for w_type in heap.ctx.types() {
            bridge.as_pyobj(w_type)?;
            report.types += 1;
        }
        info!("{} type descriptors ready", report.types);

        let items = vec![heap.new_int(1), heap.new_str("two"), heap.ctx.none];
        let w_tuple = heap.new_tuple(items.clone());
        let owned = bridge.make_ref(w_tuple)?;
        // SAFETY: `owned` is a new reference from make_ref.
        let back = unsafe { bridge.get_w_obj_and_decref(owned) }?;
        if back != w_tuple || heap.tuple_items(back).as_deref() != Some(&items[..]) {
            return Err("tuple did not survive the round trip".into());
        }
        debug!("tuple mirror at {:p}", PyObjectPtr::as_ptr(owned));

        let stats = heap.collect();
        debug!("{stats:?}");
        report.released = bridge.drain_dead();
        report.links = bridge.links.len();
        Ok(report)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pybridge_cpyext::TypeInitPolicy;

    fn output(opts: &Opts) -> String {
        let mut out = Vec::new();
        run_command(opts, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn opts(command: Command) -> Opts {
        Opts {
            command,
            verbose: 0,
            type_init: None,
            exported_only: false,
        }
    }

    #[test]
    fn test_layout_lists_header_fields() {
        let text = output(&opts(Command::Layout));
        assert!(text.lines().any(|line| line.starts_with("PyObject") && line.contains("ob_refcnt")));
        assert!(text.contains("tp_mro"));
    }

    #[test]
    fn test_exported_functions() {
        let all = output(&opts(Command::Functions));
        let exported = output(&Opts {
            exported_only: true,
            ..opts(Command::Functions)
        });
        assert!(exported.contains("PyType_Ready"));
        assert!(exported.contains("PyGILState_Ensure"));
        assert!(!exported.contains("<internal>"));
        assert!(all.contains("<internal>"));
        assert!(all.lines().count() > exported.lines().count());
    }

    #[test]
    fn test_self_check() {
        for policy in [TypeInitPolicy::Lazy, TypeInitPolicy::Eager] {
            let report = self_check(Settings::default().with_type_init(policy)).unwrap();
            assert_eq!(report.types, pybridge_vm::Heap::new().ctx.types().count());
            assert!(report.released >= 1);
        }
    }
}
