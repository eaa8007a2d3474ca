use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use rps_classifier::classifier::{Classifier, LabelTable};
use rps_classifier::config::{Settings, DEFAULT_CONFIG_FILE};
use rps_classifier::decoder::{ImageDecoder, PixelScale};
use rps_classifier::pipeline::Pipeline;
use rps_classifier::server::{self, routes::IndexPage};
use rps_classifier::{torch, util};
use std::{env, process};
use tracing::{info, warn};

const USAGE: &str = "usage: ./rps-server [config file]";

fn get_args() -> String {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => DEFAULT_CONFIG_FILE.to_string(),
        2 => args[1].clone(),
        _ => {
            println!("{USAGE}");
            process::exit(1);
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load(&get_args())?;
    util::init_tracing(&settings.log.level);

    let decoder = ImageDecoder::new(&settings.decoder);
    if decoder.scale() == PixelScale::Raw {
        warn!("serving raw 0-255 pixels; models trained on rescaled input expect decoder.pixel_scale = \"unit\"");
    }

    let labels = LabelTable::default();
    let model = torch::load_model(&settings.model, labels.len())?;
    let pipeline = web::Data::new(Pipeline::new(decoder, Classifier::new(model, labels)));

    let page = match &settings.server.static_page {
        Some(path) => IndexPage(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        ),
        None => IndexPage::default(),
    };
    let page = web::Data::new(page);

    let max_payload = settings.server.max_payload_bytes;
    let addr = (settings.server.host.clone(), settings.server.port);
    info!("listening on {}:{}", addr.0, addr.1);

    HttpServer::new(move || {
        App::new()
            .app_data(pipeline.clone())
            .app_data(page.clone())
            .app_data(server::json_config(max_payload))
            .wrap(middleware::Logger::default())
            .configure(server::configure)
    })
    .bind(addr)?
    .run()
    .await?;

    Ok(())
}
