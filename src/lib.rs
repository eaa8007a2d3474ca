pub mod classifier;
pub mod config;
pub mod decoder;
pub mod gesture;
pub mod pipeline;
pub mod server;
pub mod torch;
pub mod trainer;

/// Side length of the square model input
pub const IMAGE_SIZE: u32 = 150;

/// Number of color channels in a decoded image
pub const CHANNELS: usize = 3;

/// Process and test utility functions
pub mod util {
    use tracing_subscriber::EnvFilter;

    /// Install the global fmt subscriber. `RUST_LOG` takes precedence over
    /// the configured directive
    pub fn init_tracing(level: &str) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_err()
        {
            tracing::debug!("tracing subscriber already installed");
        }
    }

    #[cfg(test)]
    pub mod test {
        use base64::{engine::general_purpose, Engine as _};
        use image::{DynamicImage, ImageOutputFormat};
        use std::io::Cursor;

        /// Encode an image with the given codec
        pub fn encode_as(image: &DynamicImage, format: ImageOutputFormat) -> Vec<u8> {
            let mut buf = Vec::new();
            image.write_to(&mut Cursor::new(&mut buf), format).unwrap();
            buf
        }

        /// Encode an image as PNG bytes
        pub fn png_bytes(image: &DynamicImage) -> Vec<u8> {
            encode_as(image, ImageOutputFormat::Png)
        }

        /// Encode an image with the given codec as a bare base64 payload
        pub fn b64_as(image: &DynamicImage, format: ImageOutputFormat) -> String {
            general_purpose::STANDARD.encode(encode_as(image, format))
        }

        /// Encode an image as a bare base64 PNG payload
        pub fn b64_png(image: &DynamicImage) -> String {
            b64_as(image, ImageOutputFormat::Png)
        }

        /// Encode an image the way a browser canvas does
        pub fn data_uri_png(image: &DynamicImage) -> String {
            format!("data:image/png;base64,{}", b64_png(image))
        }

        /// An empty directory under the system temp dir, unique per test
        /// name and process
        pub fn scratch_dir(name: &str) -> std::path::PathBuf {
            let dir = std::env::temp_dir().join(format!(
                "rps-classifier-{name}-{}",
                std::process::id()
            ));
            let _ = std::fs::remove_dir_all(&dir);
            std::fs::create_dir_all(&dir).unwrap();
            dir
        }

        /// A solid color RGB test frame
        pub fn solid_rgb(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
            DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
                width,
                height,
                image::Rgb(rgb),
            ))
        }
    }
}
