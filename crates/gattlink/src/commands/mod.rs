//! Subcommand handlers.

pub mod config_cmd;
pub mod watch;

use std::path::PathBuf;

use gattlink_config::{self as config, Config};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Config file in effect: `--config` if given, else the platform default.
pub(crate) fn config_file(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(config::config_path)
}

pub(crate) fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    Ok(config::load_config_from(&config_file(global))?)
}
