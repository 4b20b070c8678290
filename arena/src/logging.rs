//! Tracing setup helpers.

use std::fs::File;

use time::format_description;
use time::OffsetDateTime;
use tracing::subscriber::set_global_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::FmtSubscriber;

/// Route all tracing output to a timestamped log file.
///
/// Will panic on error.
pub fn init_file_logger() {
    let file_name = log_file_name();
    let file = File::create(file_name).unwrap();
    let writer = BoxMakeWriter::new(file);
    let timer = tracing_subscriber::fmt::time::UtcTime::new(
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").unwrap(),
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::TRACE)
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber).expect(
        "Could not set global default tracing subscriber. \
         Consider disabling logs if you are already setting a subscriber.",
    );
}

fn log_file_name() -> String {
    let format = format_description::parse("[year]-[month]-[day]_[hour][minute][second]_arena.log")
        .unwrap();
    OffsetDateTime::now_utc().format(&format).unwrap()
}
