use std::{fs, io, sync::LazyLock};

use env_logger::{Env, Target};
use regex::Regex;

use crate::config::Config;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[([0-9]{1,2}(;[0-9]{1,2})*)?[m|K]").unwrap());

/// Install the global logger.
///
/// Stdout carries the JSON-RPC stream, so records go to
/// `<log_dir>/<name>.log`. The filter is read from `VITEST_EXPLORER_LOG`
/// and defaults to `info`.
pub fn init_logging(config: &Config, name: &str) -> io::Result<()> {
    let log_dir = config.log_dir();
    fs::create_dir_all(&log_dir)?;
    let file = fs::File::create(log_dir.join(format!("{name}.log")))?;
    env_logger::Builder::from_env(Env::new().filter_or("VITEST_EXPLORER_LOG", "info"))
        .target(Target::Pipe(Box::new(file)))
        .try_init()
        .map_err(io::Error::other)
}

/// Clean ANSI escape sequences from text.
pub fn clean_ansi(input: &str) -> String {
    ANSI_ESCAPE.replace_all(input, "").to_string()
}

/// Turn bare `\n` into `\r\n`, the line ending run output expects.
pub fn to_crlf(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\n', "\r\n")
}
