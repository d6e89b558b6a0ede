use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

use crate::{TransError, TransResult};

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)}|{l}|{m}{n}";

#[cfg(feature = "debug")]
const ROOT_LEVEL: LevelFilter = LevelFilter::Debug;

#[cfg(not(feature = "debug"))]
const ROOT_LEVEL: LevelFilter = LevelFilter::Info;

pub fn init_log<P: AsRef<Path>>(log_path: Option<P>) -> TransResult<()> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));
    let mut root = Root::builder().appender("stdout");

    if let Some(path) = log_path {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(path)
            .map_err(TransError::Io)?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    let config = builder
        .build(root.build(ROOT_LEVEL))
        .map_err(|e| TransError::Config(e.to_string()))?;

    log4rs::init_config(config).map_err(|e| TransError::Config(e.to_string()))?;
    Ok(())
}
