#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate pretty_env_logger;
extern crate galera_balancer;

use clap::{Arg, App as ClapApp};
use galera_balancer::{app, config, signal};
use std::fs;
use std::io::Read;
use std::process;

fn main() {
    drop(pretty_env_logger::init());

    let opts = mk_app().get_matches();
    let config_path = opts.value_of(CONFIG_PATH_ARG).unwrap();

    let config_str = match read_file(config_path) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot read {}: {}", config_path, e);
            process::exit(1);
        }
    };

    let config = match config::from_str(&config_str) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {}", e);
            process::exit(1);
        }
    };

    let mut balancer = match app::configure(config) {
        Ok(a) => a,
        Err(e) => {
            error!("failed to start: {}", e);
            process::exit(1);
        }
    };

    signal::install();

    if let Err(e) = balancer.run() {
        error!("error while running: {}", e);
        process::exit(1);
    }

    info!("closing.");
}

fn read_file(path: &str) -> ::std::io::Result<String> {
    let mut s = String::new();
    fs::File::open(path)?.read_to_string(&mut s)?;
    Ok(s)
}

static CONFIG_PATH_ARG: &'static str = "PATH";

fn mk_app() -> ClapApp<'static, 'static> {
    ClapApp::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(Arg::with_name(CONFIG_PATH_ARG)
            .required(true)
            .index(1)
            .help("Config file path."))
}
