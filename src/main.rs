use tracing_subscriber::EnvFilter;
use viewer_bridge::cli::CliOverrides;
use viewer_bridge::run_with_overrides;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli_overrides = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed.into_config_overrides(),
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    match pollster::block_on(run_with_overrides(cli_overrides)) {
        Ok(summary) => {
            println!("engine module     : {}", summary.module);
            println!("memory budget     : {} bytes ({} attempt(s))", summary.memory_budget, summary.bootstrap_attempts);
            println!("scene             : {}", summary.scene_source.as_deref().unwrap_or("<empty scene>"));
            println!(
                "status label      : {}x{} texture, content {}x{}",
                summary.label.width, summary.label.height, summary.label.content_width, summary.label.content_height
            );
            println!("frames            : {} rendered of {} ticks", summary.frames_rendered, summary.frames_ticked);
            println!("released          : {:?}", summary.shutdown);
        }
        Err(err) => {
            eprintln!("Application error: {err:?}");
            std::process::exit(1);
        }
    }
}
