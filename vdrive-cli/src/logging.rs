/// Initialise `env_logger`. `RUST_LOG` wins; otherwise `-v` raises the level to info, `-vv` to debug.
pub fn init(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();
}
