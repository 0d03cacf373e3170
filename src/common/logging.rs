use anyhow::Result;
use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::{IsTerminal, Write};

/// Initialize logging for a daemon.
///
/// `RUST_LOG` wins over `verbose` when it is set. Colors are only used when
/// stderr is a terminal so journald output stays readable.
pub fn init(verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let color = std::io::stderr().is_terminal();

    Builder::new()
        .filter_level(level)
        .parse_env(Env::default())
        .format(move |buf, record| format_log(buf, record, color))
        .try_init()?;

    Ok(())
}

fn level_label(level: log::Level, color: bool) -> &'static str {
    match (level, color) {
        (log::Level::Error, true) => "\x1b[31mERROR\x1b[0m",
        (log::Level::Warn, true) => "\x1b[33mWARN \x1b[0m",
        (log::Level::Info, true) => "\x1b[32mINFO \x1b[0m",
        (log::Level::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
        (log::Level::Trace, true) => "\x1b[35mTRACE\x1b[0m",
        (log::Level::Error, false) => "ERROR",
        (log::Level::Warn, false) => "WARN ",
        (log::Level::Info, false) => "INFO ",
        (log::Level::Debug, false) => "DEBUG",
        (log::Level::Trace, false) => "TRACE",
    }
}

fn format_log(
    buf: &mut env_logger::fmt::Formatter,
    record: &log::Record,
    color: bool,
) -> std::io::Result<()> {
    // Last path segment only, e.g. "controller"
    let target = record.target();
    let module = target.split("::").last().unwrap_or(target);

    writeln!(
        buf,
        "{} {} [{:>10}] {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        level_label(record.level(), color),
        module,
        record.args()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_labels_have_no_escape_codes() {
        for level in [
            log::Level::Error,
            log::Level::Warn,
            log::Level::Info,
            log::Level::Debug,
            log::Level::Trace,
        ] {
            let label = level_label(level, false);
            assert!(!label.contains('\x1b'));
            assert_eq!(label.len(), 5);
            assert!(level_label(level, true).contains('\x1b'));
        }
    }
}
