use crate::config::BridgeConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    memory_mb: Option<u64>,
    max_texture: Option<u32>,
    engine: Option<PathBuf>,
    frames: Option<u32>,
    scene: Option<PathBuf>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // program name
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Flags take the form --name value.");
            };
            let value = iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "memory-mb" => {
                    let memory_mb = value.parse::<u64>().with_context(|| format!("Invalid memory budget '{value}'"))?;
                    if memory_mb == 0 {
                        bail!("Memory budget must be at least 1 MiB");
                    }
                    overrides.memory_mb = Some(memory_mb);
                }
                "max-texture" => {
                    overrides.max_texture =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid texture size '{value}'"))?);
                }
                "frames" => {
                    overrides.frames =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid frame count '{value}'"))?);
                }
                "engine" => overrides.engine = Some(PathBuf::from(value)),
                "scene" => overrides.scene = Some(PathBuf::from(value)),
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --memory-mb, --max-texture, --engine, --frames, --scene."
                ),
            }
        }
        Ok(overrides)
    }

    pub fn into_config_overrides(self) -> BridgeConfigOverrides {
        BridgeConfigOverrides {
            memory_mb: self.memory_mb,
            max_texture: self.max_texture,
            engine: self.engine,
            frames: self.frames,
            scene: self.scene,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_flag() {
        let args = [
            "viewer_bridge",
            "--memory-mb",
            "64",
            "--max-texture",
            "1024",
            "--engine",
            "libengine.so",
            "--frames",
            "10",
            "--scene",
            "plant.vds",
        ];
        let overrides = CliOverrides::parse(args).expect("parse overrides").into_config_overrides();
        assert_eq!(overrides.memory_mb, Some(64));
        assert_eq!(overrides.max_texture, Some(1024));
        assert_eq!(overrides.engine, Some(PathBuf::from("libengine.so")));
        assert_eq!(overrides.frames, Some(10));
        assert_eq!(overrides.scene, Some(PathBuf::from("plant.vds")));
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["viewer_bridge", "--frames", "1", "--frames", "5"];
        let overrides = CliOverrides::parse(args).expect("parse overrides").into_config_overrides();
        assert_eq!(overrides.frames, Some(5));
        assert_eq!(overrides.applied_fields(), vec!["frames"]);
    }

    #[test]
    fn missing_value_errors() {
        let err = CliOverrides::parse(["viewer_bridge", "--engine"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_unknown_flags_and_bad_numbers() {
        let err = CliOverrides::parse(["viewer_bridge", "--width", "10"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
        let err = CliOverrides::parse(["viewer_bridge", "--memory-mb", "0"]).unwrap_err();
        assert!(err.to_string().contains("at least 1 MiB"));
        let err = CliOverrides::parse(["viewer_bridge", "--frames", "many"]).unwrap_err();
        assert!(err.to_string().contains("Invalid frame count"));
    }
}
