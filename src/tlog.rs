use std::io::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};

static LOG_LEVEL: AtomicU8 = AtomicU8::new(level_to_u8(slog::Level::Info));

const fn level_to_u8(lvl: slog::Level) -> u8 {
    match lvl {
        slog::Level::Critical => 1,
        slog::Level::Error => 2,
        slog::Level::Warning => 3,
        slog::Level::Info => 4,
        slog::Level::Debug => 5,
        slog::Level::Trace => 6,
    }
}

pub fn set_log_level(lvl: slog::Level) {
    LOG_LEVEL.store(level_to_u8(lvl), Ordering::Relaxed);
}

#[must_use]
pub fn log_level() -> slog::Level {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        1 => slog::Level::Critical,
        2 => slog::Level::Error,
        3 => slog::Level::Warning,
        4 => slog::Level::Info,
        5 => slog::Level::Debug,
        _ => slog::Level::Trace,
    }
}

pub struct Drain;

pub fn root() -> slog::Logger {
    slog::Logger::root(Drain, slog::o!())
}

#[macro_export]
macro_rules! tlog {
    ($lvl:ident, $($args:tt)*) => {{
        let logger = $crate::tlog::root();
        slog::slog_log!(logger, slog::Level::$lvl, "", $($args)*);
    }}
}

impl slog::Drain for Drain {
    type Ok = ();
    type Err = slog::Never;
    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> Result<Self::Ok, Self::Err> {
        // Max level is constant = trace, it's hardcoded in Cargo.toml.
        // In runtime it's managed by `set_log_level`.
        if level_to_u8(record.level()) > LOG_LEVEL.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut s = StrSerializer {
            str: format!("{}", record.msg()),
        };
        use slog::KV;
        // StrSerializer never fails, writes into a String can't either.
        let _ = record.kv().serialize(record, &mut s);
        let _ = values.serialize(record, &mut s);

        let _ = writeln!(
            std::io::stderr().lock(),
            "{} {}:{} {}",
            record.level().as_short_str(),
            record.file(),
            record.line(),
            s.str
        );
        Ok(())
    }
}

struct StrSerializer {
    pub str: String,
}

impl slog::Serializer for StrSerializer {
    fn emit_arguments(&mut self, key: slog::Key, val: &std::fmt::Arguments) -> slog::Result {
        use std::fmt::Write;
        let _ = write!(&mut self.str, ", {key}: {val}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_roundtrip() {
        let prev = log_level();
        set_log_level(slog::Level::Debug);
        assert_eq!(log_level(), slog::Level::Debug);
        crate::tlog!(Debug, "planner log smoke test"; "rel" => 3);
        set_log_level(prev);
    }
}
