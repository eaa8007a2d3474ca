//! Entrypoint to train the gesture network from a labeled image directory

use rps_classifier::classifier::LabelTable;
use rps_classifier::config::{Settings, DEFAULT_CONFIG_FILE};
use rps_classifier::decoder::ImageDecoder;
use rps_classifier::trainer::Trainer;
use rps_classifier::util;
use std::{env, process};

const USAGE: &str = "usage: ./rps-train [config file]";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let config_file = match args.len() {
        1 => DEFAULT_CONFIG_FILE,
        2 => args[1].as_str(),
        _ => {
            println!("{USAGE}");
            process::exit(1);
        }
    };

    let settings = Settings::load(config_file)?;
    util::init_tracing(&settings.log.level);

    let trainer = Trainer::new(
        settings.train,
        ImageDecoder::new(&settings.decoder),
        LabelTable::default(),
    );
    trainer.run()?;
    Ok(())
}
