#![deny(clippy::print_stdout, clippy::print_stderr)]

use dupewatch::{config, supervisor};

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();
}

fn main() {
    init_logger();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match config::parse(args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("[ERROR] {e}");
            std::process::exit(1);
        }
    };

    std::process::exit(supervisor::run(config));
}
