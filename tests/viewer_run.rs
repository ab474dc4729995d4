use pollster::block_on;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use viewer_bridge::config::BridgeConfig;
use viewer_bridge::run_with_config;

fn mock_config(frames: u32) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.render.frames = frames;
    config.runtime.client_id = "viewer-tests".to_string();
    config
}

#[test]
fn demo_run_renders_and_releases_everything() {
    let config = mock_config(4);
    let summary = block_on(run_with_config(&config)).expect("run");

    assert_eq!(summary.module, "mock");
    assert_eq!(summary.memory_budget, 128 * 1024 * 1024);
    assert_eq!(summary.bootstrap_attempts, 1);
    assert_eq!(summary.scene_source, None);
    assert_eq!(summary.frames_ticked, 4);
    assert_eq!(summary.frames_rendered, 4);
    assert!(summary.label.width.is_power_of_two());
    assert!(summary.label.height.is_power_of_two());
    assert!(summary.label.content_width <= summary.label.width);
    assert_eq!(summary.shutdown.renderers, 1);
    assert_eq!(summary.shutdown.cameras, 1);
    assert_eq!(summary.shutdown.textures, 1);
    assert_eq!(summary.shutdown.discarded_commands, 0);
}

#[test]
fn scene_files_are_staged_into_the_engine() {
    let mut scene = NamedTempFile::new().expect("temp scene");
    write!(scene, "locked:hunter2\nnodes").expect("write scene");

    let mut config = mock_config(1);
    config.scene.path = Some(scene.path().to_path_buf());
    config.scene.password = Some("hunter2".to_string());
    let summary = block_on(run_with_config(&config)).expect("run");
    let source = summary.scene_source.expect("scene source");
    assert!(source.starts_with("/vfs/"), "scene staged inside the sandbox: {source}");

    config.scene.password = Some("wrong".to_string());
    let err = block_on(run_with_config(&config)).unwrap_err();
    assert!(format!("{err:#}").contains("loading scene"), "error should carry context: {err:#}");
}

#[test]
fn missing_engine_library_is_reported() {
    let mut config = mock_config(1);
    config.runtime.engine_library = Some(PathBuf::from("target/definitely-missing-engine.so"));
    let err = block_on(run_with_config(&config)).unwrap_err();
    assert!(format!("{err:#}").contains("definitely-missing-engine"));
}

#[test]
fn tiny_texture_limits_shrink_the_status_label() {
    let mut config = mock_config(1);
    config.textures.max_texture_size = 16;
    let summary = block_on(run_with_config(&config)).expect("run");
    assert!(summary.label.width <= 16 && summary.label.height <= 16);
    assert!(summary.label.scale < 1.0);
}
