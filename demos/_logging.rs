use std::io::Write;

pub fn init(root_module: &str, verbosity: i8) {
    let log_level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .format(|buffer, record: &log::Record| {
            let prefix = match record.level() {
                log::Level::Trace => "Trace: ",
                log::Level::Debug | log::Level::Info => "",
                log::Level::Warn => "Warning: ",
                log::Level::Error => "Error: ",
            };
            let style = buffer.default_level_style(record.level());

            writeln!(
                buffer,
                "{} [{}] {style}{}{style:#}{}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                std::thread::current().name().unwrap_or("main"),
                prefix,
                record.args(),
            )
        })
        .filter_level(log::LevelFilter::Warn)
        .filter_module(root_module, log_level)
        .filter_module("apt_stage", log_level)
        .init();
}
