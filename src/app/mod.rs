pub mod args;
pub mod logger;
pub mod server;

use log::info;
use std::io::{self, IsTerminal, Write};
use tokio::runtime::Builder;

use crate::config::{get_config, Config, VERSION};

pub use args::{parse, Args, LogFormat};
pub use server::run_server;

/// Parse the configuration before the real runtime and logger exist, so a
/// bad file fails fast with a readable message.
pub fn init_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    {
        let runtime = Builder::new_multi_thread().worker_threads(1).enable_all().build()?;
        runtime.block_on(async {
            match crate::config::load_config(args.config_file.as_str()).await {
                Ok(_) => (),
                Err(err) => {
                    let stdin = io::stdin();
                    if stdin.is_terminal() {
                        eprintln!("Config parse error: {err}");
                        io::stdout().flush().unwrap();
                    } else {
                        log::error!("Config parse error: {err:?}");
                    }
                    std::process::exit(exitcode::CONFIG);
                }
            };
        });
    }

    Ok((*get_config()).clone())
}

pub fn init_logging(args: &Args, config: &Config) {
    logger::init(args, config);
    info!("Welcome to AProxy! (Version {VERSION})");
}
