#![allow(mixed_script_confusables)]

use std::env;
use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use log::info;

mod core;
mod walkthrough;

use crate::walkthrough::WalkthroughConfiguration;

fn initialize_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn main() -> Result<(), Box<dyn Error>> {
    initialize_logging();
    let args = env::args().collect::<Vec<_>>();
    let mut configuration = WalkthroughConfiguration::default();

    let instructions = "pass nothing to run every cell, or one of `--convolution`, \
        `--autograd`, `--no-gradient`, `--graph [DOT file]`";

    if args.len() <= 1 {
        walkthrough::run_all(&configuration)?;
        return Ok(());
    }

    match args[1].as_str() {
        "--convolution" => {
            walkthrough::convolution_cell(&configuration)?;
        }
        "--autograd" => {
            let chain = walkthrough::gradient_cell()?;
            walkthrough::graph_cell(&chain, &configuration)?;
            walkthrough::norm_loop_cell(&configuration)?;
        }
        "--no-gradient" => {
            walkthrough::no_gradient_cell();
        }
        "--graph" => {
            configuration.graph_output = args.get(2).map(PathBuf::from);
            if let Some(path) = &configuration.graph_output {
                info!("graph will be written to {:?}", path);
            }
            let chain = walkthrough::gradient_cell()?;
            walkthrough::graph_cell(&chain, &configuration)?;
        }
        _ => {
            println!("{}", instructions);
        }
    }
    Ok(())
}
