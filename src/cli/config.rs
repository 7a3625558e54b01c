//! Config init command

use crate::cli::ConfigInitArgs;

const EXAMPLE_CONFIG: &str = include_str!("../../portico.example.toml");

/// Write the commented example configuration to disk.
pub fn handle_config_init(args: &ConfigInitArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.output.exists() && !args.force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            args.output.display()
        )
        .into());
    }

    std::fs::write(&args.output, EXAMPLE_CONFIG)?;
    println!("Wrote {}", args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_parseable_config() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("portico.toml");
        let args = ConfigInitArgs {
            output: output.clone(),
            force: false,
        };

        handle_config_init(&args).unwrap();

        let config = crate::config::PorticoConfig::load(Some(&output)).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_init_refuses_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("portico.toml");
        std::fs::write(&output, "# existing").unwrap();

        let args = ConfigInitArgs {
            output: output.clone(),
            force: false,
        };
        assert!(handle_config_init(&args).is_err());

        let args = ConfigInitArgs {
            output,
            force: true,
        };
        handle_config_init(&args).unwrap();
    }
}
