//! GPU kernel runner CLI - Render a compute kernel from JSON configuration.

use std::fs;
use std::time::Instant;

use gpu_kernel_runner::{
    image::{ComponentType, DisplaySink, PixelFormat, TevSink},
    pipeline::{self, RunError},
    schema::RenderConfig,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().skip(1).any(|a| a == "--help" || a == "-h") {
        print_usage(&args[0]);
        return;
    }

    if args.get(1).is_some_and(|a| a == "--example") {
        print_example_config();
        return;
    }

    let config = match args.get(1) {
        Some(path) => RenderConfig::from_file(path).unwrap_or_else(|e| {
            eprintln!("error during configuration: {e}");
            std::process::exit(1);
        }),
        None => RenderConfig::default(),
    };

    println!("GPU Kernel Runner");
    println!("=================");
    println!("Output: {}x{}", config.width, config.height);
    println!(
        "Shader: {}",
        config
            .shader
            .as_ref()
            .map_or_else(|| "basic_uv.wgsl (bundled)".to_string(), |p| p.display().to_string())
    );
    println!("Entry point: {}", config.entry_point);
    println!();

    let start = Instant::now();
    if let Err(e) = run(&config) {
        eprintln!("error during {}: {e}", e.stage());
        std::process::exit(1);
    }
    println!("Done in {:.2}s", start.elapsed().as_secs_f32());
}

fn run(config: &RenderConfig) -> Result<(), RunError> {
    let raw = pipeline::render_raw(config)?;

    if let Some(address) = &config.tev {
        let mut sink = TevSink::new(address.clone());
        if let Err(e) = sink.show(&config.display_label, &raw) {
            log::warn!("Skipping tev display: {e}");
        }
    }

    let image = raw.convert(PixelFormat::Rgb, ComponentType::UInt8, config.srgb_gamma);
    if let Some(parent) = config.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(gpu_kernel_runner::image::ExportError::from)?;
    }
    image.write(&config.output)?;
    println!("Wrote {}", config.output.display());
    Ok(())
}

fn print_usage(program: &str) {
    eprintln!("Usage: {program} [config.json]");
    eprintln!();
    eprintln!("Run a compute kernel once and write the result as PNG.");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.json  Path to render configuration (default: bundled UV shader)");
    eprintln!();
    eprintln!("Example configuration is printed with the --example flag.");
}

fn print_example_config() {
    let config = RenderConfig {
        tev: Some(gpu_kernel_runner::image::TEV_DEFAULT_ADDRESS.to_string()),
        ..Default::default()
    };
    match serde_json::to_string_pretty(&config) {
        Ok(json) => {
            println!("Example configuration (config.json):");
            println!("{json}");
        }
        Err(e) => eprintln!("Failed to serialize example config: {e}"),
    }
}
