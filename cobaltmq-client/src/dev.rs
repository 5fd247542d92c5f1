use std::io::Write;

/// Initializes the env_logger based logging with a terse format, handy in
/// examples and integration tests.
pub fn setup_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - [{}] {}:{} {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .try_init()
        .ok();
}
