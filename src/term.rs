//! Terminal capability detection.

use std::io::IsTerminal;

fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some_and(|v| !v.is_empty())
}

/// Whether log output on `stream` should carry ANSI colors.
///
/// `FORCE_COLOR` wins, then `NO_COLOR`, then whether the stream is a terminal at all.
pub fn should_use_color<T: IsTerminal>(stream: &T) -> bool {
    env_flag("FORCE_COLOR") || (stream.is_terminal() && !env_flag("NO_COLOR"))
}
